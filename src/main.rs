//! `cloudctl`: thin entry point delegating to `cloud_cli::run`.

use std::process::ExitCode;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    cloud_cli::run()
}
