//! Generates `include/fetch_ffi.h` for the mobile host.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    let include_dir = crate_dir.join("include");

    // header generation is best effort; the library builds without it
    let generated = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("FETCH_FFI_H")
        .with_cpp_compat(true)
        .generate();
    match generated {
        Ok(bindings) if std::fs::create_dir_all(&include_dir).is_ok() => {
            bindings.write_to_file(include_dir.join("fetch_ffi.h"));
        }
        Ok(_) => println!("cargo:warning=could not create {}", include_dir.display()),
        Err(e) => println!("cargo:warning=header not generated: {e}"),
    }
}
