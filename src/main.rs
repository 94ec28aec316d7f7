use std::process::ExitCode;

fn main() -> ExitCode {
    gc_bridge::run_cli()
}
