pub mod csv;
pub mod line_protocol;
