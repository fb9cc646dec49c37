use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=LEVMAR_LIB_DIR");

    if env::var_os("CARGO_FEATURE_SYSTEM").is_none() {
        return;
    }

    if let Ok(lib_dir) = env::var("LEVMAR_LIB_DIR") {
        println!("cargo:rustc-link-search=native={lib_dir}");
    }
    println!("cargo:rustc-link-lib=levmar");
}
