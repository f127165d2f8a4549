fn main() {
    // ESP-IDF link arguments only apply to firmware builds; host builds and
    // tests skip them.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
