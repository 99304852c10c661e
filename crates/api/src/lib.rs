//! Generated gRPC stubs for the supervisor and worker services.

pub mod fabric {
    include!(concat!(env!("OUT_DIR"), "/fabric.rs"));
}
