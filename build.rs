fn main() {
    #[cfg(feature = "proto-gen")]
    {
        println!("cargo:rerun-if-changed=proto/anonvote.proto");
        tonic_build::configure()
            .build_server(true)
            .build_client(true)
            .out_dir("src/proto")
            .compile(&["proto/anonvote.proto"], &["proto"])
            .unwrap_or_else(|e| panic!("Failed to compile proto/anonvote.proto: {e}"));
    }
}
