fn main() {
    prost_build::compile_protos(
        &["../proto/sovereign/v1/envelope.proto"],
        &["../proto"],
    )
    .expect("failed to compile envelope.proto");
    println!("cargo:rerun-if-changed=../proto/sovereign/v1/envelope.proto");
}
