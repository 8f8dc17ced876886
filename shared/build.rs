fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = prost_build::Config::new();
    // Keep enum prefixes so variants read the same at every call site
    config.retain_enum_prefix();
    config.type_attribute(".", "#[allow(clippy::enum_variant_names)]");

    config.compile_protos(&["proto/graphnav.proto"], &["proto/"])?;

    println!("cargo:rerun-if-changed=proto/graphnav.proto");

    Ok(())
}
