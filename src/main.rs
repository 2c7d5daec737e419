//! tunecache command-line entry point.

use clap::Parser;
use tunecache::{
    cli::Cli,
    error::{ExitCode, StructuredError},
    library::LibraryError,
};

fn main() {
    let cli = Cli::parse();
    let json_errors = cli.json_errors;

    match tunecache::run_app(cli) {
        Ok(code) => std::process::exit(code.as_i32()),
        Err(err) => {
            let interrupted = err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<LibraryError>(), Some(LibraryError::Interrupted)));
            let exit_code = if interrupted {
                ExitCode::Interrupted
            } else {
                ExitCode::GeneralError
            };

            if json_errors {
                match serde_json::to_string_pretty(&StructuredError::new(&err, exit_code)) {
                    Ok(json) => eprintln!("{}", json),
                    Err(_) => eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err),
                }
            } else {
                eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err);
            }

            std::process::exit(exit_code.as_i32());
        }
    }
}
