use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/store.proto");
    // the gRPC store is opt-in, plain builds need no `protoc`
    let grpc = std::env::var_os("CARGO_FEATURE_SERVER").is_some()
        || std::env::var_os("CARGO_FEATURE_CLIENT").is_some();
    if !grpc {
        return Ok(());
    }
    let proto_path: &Path = "proto/store.proto".as_ref();
    let target = std::env::var("TARGET")?;
    // directory the .proto file resides in
    let proto_dir = proto_path
        .parent()
        .ok_or("proto file should reside in a directory")?;
    tonic_build::configure()
        .build_transport(target != "wasm32-unknown-unknown")
        .compile(&[proto_path], &[proto_dir])?;
    Ok(())
}
