pub mod dicomweb;
pub mod dimse;
