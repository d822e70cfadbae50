//! Compiles the Spotify wire-format `.proto` schemas under `proto/` into
//! Rust modules under `OUT_DIR`, the same way `librespot-protocol` builds
//! its own copies of Spotify's protobuf schemas.

use std::path::Path;

fn main() {
  let proto_dir = Path::new("proto");
  let protos = [
    "login5.proto",
    "connect.proto",
    "context.proto",
    "collection.proto",
    "playlist.proto",
  ];

  let inputs: Vec<_> = protos.iter().map(|p| proto_dir.join(p)).collect();

  protobuf_codegen::Codegen::new()
    .pure()
    .includes([proto_dir])
    .inputs(&inputs)
    .cargo_out_dir("spotify_proto")
    .run_from_script();

  for proto in &protos {
    println!("cargo:rerun-if-changed={}", proto_dir.join(proto).display());
  }
}
