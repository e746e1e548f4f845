//! Messages and generated service glue for the `detector.Detector` gRPC service.

tonic::include_proto!("detector");

/// Encoded descriptor set, registered with the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("detector");
