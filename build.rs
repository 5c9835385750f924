//! Embeds build metadata reported in the daemon's startup log line
//! (`VERGEN_BUILD_TIMESTAMP`, `VERGEN_CARGO_TARGET_TRIPLE`).

use vergen::{BuildBuilder, CargoBuilder, Emitter};

fn main() {
    let mut emitter = Emitter::default();

    match BuildBuilder::all_build() {
        Ok(build) => {
            if let Err(e) = emitter.add_instructions(&build) {
                println!("cargo:warning=build timestamp unavailable: {e}");
            }
        }
        Err(e) => println!("cargo:warning=build timestamp unavailable: {e}"),
    }
    match CargoBuilder::all_cargo() {
        Ok(cargo) => {
            if let Err(e) = emitter.add_instructions(&cargo) {
                println!("cargo:warning=target triple unavailable: {e}");
            }
        }
        Err(e) => println!("cargo:warning=target triple unavailable: {e}"),
    }

    if let Err(e) = emitter.emit() {
        eprintln!("vergen emit skipped: {e}");
    }
}
