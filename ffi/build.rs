//! Generates `include/requests.h` from the `extern "C"` surface.

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    let crate_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string()));
    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("REQUESTS_H".to_string()),
        cpp_compat: true,
        ..Default::default()
    };

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            let include = crate_dir.join("include");
            if let Err(e) = std::fs::create_dir_all(&include) {
                println!("cargo:warning=cannot create {}: {e}", include.display());
                return;
            }
            bindings.write_to_file(include.join("requests.h"));
        }
        Err(e) => println!("cargo:warning=cbindgen failed, header not regenerated: {e}"),
    }
}
