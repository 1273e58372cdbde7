fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        return;
    }

    let icon_path = "../assets/stepshell.ico";
    println!("cargo:rerun-if-changed={icon_path}");
    if !std::path::Path::new(icon_path).exists() {
        println!(
            "cargo:warning=stepshell-core: Windows icon missing at {icon_path}; continuing without embedded icon"
        );
        return;
    }

    let mut res = winres::WindowsResource::new();
    res.set_icon(icon_path);
    res.set("FileDescription", "StepShell desktop shell");
    if let Err(error) = res.compile() {
        println!("cargo:warning=stepshell-core: failed to compile Windows resources: {error}");
    }
}
