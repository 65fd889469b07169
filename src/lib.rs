pub mod adapters;
pub mod core;
pub mod runtime;

#[cfg(test)]
mod testing;

pub fn run() -> std::process::ExitCode {
    env_logger::init();
    runtime::cli::run()
}
