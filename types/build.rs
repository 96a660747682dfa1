fn main() {
    println!("cargo:rerun-if-changed=proto/coord.proto");

    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    tonic_prost_build::configure()
        .compile_protos(&["proto/coord.proto"], &["proto/"])
        .expect("Failed to compile proto/coord.proto");
}
