use std::process::ExitCode;

fn main() -> ExitCode {
    pruneguard::shim::run(std::env::args_os().collect())
}
