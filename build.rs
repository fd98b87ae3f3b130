use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=DIRETTA_SDK_PATH");

    // The Diretta SDK is proprietary and only linked when requested.
    if env::var_os("CARGO_FEATURE_VENDOR_SDK").is_some() {
        let sdk = env::var("DIRETTA_SDK_PATH")
            .expect("vendor-sdk feature enabled but DIRETTA_SDK_PATH is not set");
        println!("cargo:rustc-link-search=native={sdk}/lib");
        println!("cargo:rustc-link-lib=static=diretta_sync");
    }
}
