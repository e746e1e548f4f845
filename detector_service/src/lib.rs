mod archive;
mod decoder;
mod models;
#[cfg(feature = "ort")]
mod ort_service;
mod processor;
mod stop_signal;
#[cfg(test)]
mod testing;

pub mod callback;
pub mod config;
pub mod error;
pub mod inference_service;
pub mod model_service;
pub mod paths;
pub mod results;
pub mod runset;
pub mod sandbox;
pub mod server;
pub mod service;

pub use decoder::{FileImageDecoder, ImageDecoder};
pub use server::GrpcServer;
#[cfg(feature = "ort")]
pub use server::start_server;
pub use stop_signal::StopState;
