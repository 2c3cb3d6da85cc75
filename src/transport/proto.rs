//! Generated protobuf/gRPC bindings for the `wstransport` service.

#![allow(clippy::all)]

tonic::include_proto!("wstransport");
