fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");

    // Messages are declared by hand in src/grpc/proto.rs, so the service stub
    // is generated without protoc.
    let check = tonic_build::manual::Method::builder()
        .name("check")
        .route_name("Check")
        .input_type("crate::grpc::proto::CheckRequest")
        .output_type("crate::grpc::proto::CheckResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("RateLimitService")
        .package("authguard.ratelimit.v1")
        .method(check)
        .build();

    tonic_build::manual::Builder::new()
        .build_client(false)
        .compile(&[service]);

    Ok(())
}
