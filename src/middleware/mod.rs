pub mod clinic_context;
