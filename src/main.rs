use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match siteaudit_cli::cli::run().await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            eprintln!("siteaudit: {err:#}");
            ExitCode::from(2)
        }
    }
}
