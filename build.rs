fn main() {
    // ESP-IDF link/env forwarding is only meaningful when cross-compiling
    // for the device; the host build (tests, simulation) skips it.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
