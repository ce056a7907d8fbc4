pub mod controller;
pub mod detector;
