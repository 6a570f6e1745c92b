//! Controller firmware drivers

pub mod smoothie;
