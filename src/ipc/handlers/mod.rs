pub mod core;
pub mod fee_plans;
pub mod imports;
pub mod packs;
pub mod sessions;
pub mod students;
pub mod teachers;
