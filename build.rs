fn main() {
    if !cfg!(target_os = "linux") {
        panic!("{} only works on linux", env!("CARGO_PKG_NAME"));
    }

    // debuggers look the MPIR symbols up in the dynamic symbol table
    println!("cargo:rustc-link-arg-bins=-Wl,--export-dynamic");
    println!("cargo:rustc-link-arg-tests=-Wl,--export-dynamic");

    #[cfg(feature = "pmix")]
    pmix::generate();
}

#[cfg(feature = "pmix")]
mod pmix {
    use std::env;
    use std::path::PathBuf;

    const MIN_VERSION: &str = "4.2";

    pub fn generate() {
        let library = pkg_config::Config::new()
            .atleast_version(MIN_VERSION)
            .probe("pmix")
            .unwrap_or_else(|e| panic!("PMIx >= {MIN_VERSION} not found: {e}"));

        let bindings = bindgen::Builder::default()
            .header_contents("pmix_shim.h", "#include <pmix_tool.h>\n")
            .clang_args(
                library
                    .include_paths
                    .iter()
                    .map(|path| format!("-I{}", path.display())),
            )
            .allowlist_function("PMIx_.*")
            .allowlist_type("pmix_.*")
            .allowlist_var("PMIX_.*")
            .derive_default(true)
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .generate()
            .expect("generate PMIx bindings");

        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
        bindings
            .write_to_file(out.join("pmix.rs"))
            .expect("write PMIx bindings");
    }
}
