fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through DOORMAN_GIT_HASH from the release pipeline
    println!("cargo:rerun-if-env-changed=DOORMAN_GIT_HASH");
    if let Ok(hash) = std::env::var("DOORMAN_GIT_HASH") {
        println!("cargo:rustc-env=DOORMAN_GIT_HASH={}", hash);
    }
}
