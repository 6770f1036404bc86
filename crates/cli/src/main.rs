fn main() -> std::process::ExitCode {
    runwarden_cli::run()
}
