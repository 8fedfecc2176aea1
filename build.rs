use std::env;

fn main() {
    // Pass CPU frequency for timing calculations
    println!("cargo:rustc-env=MCU_FREQ_HZ=16000000");
    println!("cargo:rerun-if-changed=build.rs");

    // Host builds run the unit tests; only the firmware links for the chip
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("avr") {
        println!("cargo:rustc-link-arg=-mmcu=atmega128a");
    }
}
