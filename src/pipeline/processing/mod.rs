// Processing stages between raw tables and the validated output table

pub mod aggregate;
pub mod normalize;
pub mod quality_gate;
pub mod reshape;
