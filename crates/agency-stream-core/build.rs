/// Builds the gRPC client and server code for `proto/agency.proto` using
/// `tonic-prost-build`.
///
/// The generated module is exposed from this crate as
/// `agency_stream_core::proto` and contains the `ContractRequestGenerator`
/// service traits, the client, and all message types.
///
/// # Panics
///
/// Panics if code generation fails (for example when `protoc` is missing).
fn main() {
    println!("cargo:rerun-if-changed=proto/agency.proto");

    let config = tonic_prost_build::Config::new();

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_with_config(config, &["proto/agency.proto"], &["proto"])
        .unwrap();
}
