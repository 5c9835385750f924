use std::process::ExitCode;

fn main() -> ExitCode {
    match pdflatexd::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pdflatexd: {e:#}");
            ExitCode::FAILURE
        }
    }
}
