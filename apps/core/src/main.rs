fn main() {
    if let Err(error) = stepshell_core::logging::init() {
        eprintln!("[stepshell] file logging unavailable: {error}");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match stepshell_core::runtime::run(&args) {
        Ok(outcome) => outcome.exit_code(),
        Err(error) => {
            eprintln!("[stepshell] {error}");
            error.exit_code()
        }
    };
    std::process::exit(code);
}
