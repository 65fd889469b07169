fn main() -> std::process::ExitCode {
    triage_lib::run()
}
