//! Request/response correlation with the control plane

pub mod correlator;

pub use correlator::{request_envelope, ResponseCorrelator, REQUEST_ID_FIELD};
