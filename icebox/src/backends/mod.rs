pub mod fdp;

pub use fdp::Fdp;
