use std::process::ExitCode;

use clap::Parser;

use fhir_harness::cli::{self, HarnessArgs};
use fhir_harness::error;

fn main() -> ExitCode {
    let args = HarnessArgs::parse();
    match cli::execute(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", error::error_chain(&err));
            ExitCode::FAILURE
        }
    }
}
