// src/phone.rs

use std::collections::BTreeSet;

/// Country-specific mobile numbering quirk: some numbers are seen both with and
/// without an extra leading mobile digit after the area code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountryRule {
    pub calling_code: &'static str,
    /// Digits between the calling code and the extra mobile digit (area code).
    pub area_digits: usize,
    pub extra_digit: char,
    /// Total length (calling code included) of the long, extra-digit form.
    pub long_len: usize,
    /// National number lengths accepted by `dialable` as "missing the calling code".
    pub national_lens: &'static [usize],
}

impl CountryRule {
    /// Brazil: 55 + DDD + 9 + 8 digits (13) is canonicalized to 55 + DDD + 8 digits (12).
    pub const BRAZIL: CountryRule = CountryRule {
        calling_code: "55",
        area_digits: 2,
        extra_digit: '9',
        long_len: 13,
        national_lens: &[10, 11],
    };

    fn extra_digit_index(&self) -> usize {
        self.calling_code.len() + self.area_digits
    }

    fn short_len(&self) -> usize {
        self.long_len - 1
    }

    fn is_long(&self, digits: &str) -> bool {
        digits.starts_with(self.calling_code)
            && digits.len() == self.long_len
            && digits[self.extra_digit_index()..].starts_with(self.extra_digit)
    }

    fn is_short(&self, digits: &str) -> bool {
        digits.starts_with(self.calling_code) && digits.len() == self.short_len()
    }
}

/// Canonicalizes phone-like identifiers into the digit-only key patients are stored under.
#[derive(Debug, Clone)]
pub struct PhoneNormalizer {
    rules: Vec<CountryRule>,
    home: CountryRule,
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self {
            rules: vec![CountryRule::BRAZIL],
            home: CountryRule::BRAZIL,
        }
    }
}

pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

impl PhoneNormalizer {
    pub fn normalize(&self, raw: &str) -> String {
        let digits = digits_only(raw);
        match self.rules.iter().find(|r| r.is_long(&digits)) {
            Some(rule) => {
                let idx = rule.extra_digit_index();
                format!("{}{}", &digits[..idx], &digits[idx + 1..])
            }
            None => digits,
        }
    }

    /// Every stored form a number may have been saved under historically.
    pub fn variants(&self, raw: &str) -> BTreeSet<String> {
        let canonical = self.normalize(raw);
        let mut out = BTreeSet::new();

        let digits = digits_only(raw);
        if !digits.is_empty() {
            out.insert(digits);
        }

        if let Some(rule) = self.rules.iter().find(|r| r.is_short(&canonical)) {
            let idx = rule.extra_digit_index();
            out.insert(format!(
                "{}{}{}",
                &canonical[..idx],
                rule.extra_digit,
                &canonical[idx..]
            ));
        }

        out.insert(canonical);
        out
    }

    /// The number without its calling code, for records saved before the code was stored.
    pub fn national(&self, canonical: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|r| canonical.starts_with(r.calling_code) && canonical.len() >= r.short_len())
            .map(|r| canonical[r.calling_code.len()..].to_string())
    }

    /// Target for an outbound send: bare national numbers get the home calling code.
    pub fn dialable(&self, raw: &str) -> String {
        let digits = digits_only(raw);
        if self.home.national_lens.contains(&digits.len())
            && !digits.starts_with(self.home.calling_code)
        {
            return format!("{}{}", self.home.calling_code, digits);
        }
        digits
    }
}
