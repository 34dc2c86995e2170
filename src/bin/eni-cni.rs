use eni_cni::commands::{run_cni, version_hint, Output};
use std::io::Write;
use tracing::error;

fn main() {
    let output = match run_cni() {
        Ok(output) => output,
        Err(err) => {
            error!("CNI plugin error: {:#}", err);
            eprintln!("eni-cni: {:#}", err);
            Output::error(&version_hint(b""), format!("{:#}", err))
        }
    };

    let mut stdout = std::io::stdout().lock();
    if !output.stdout.is_empty() {
        let _ = writeln!(stdout, "{}", output.stdout);
    }
    let _ = stdout.flush();

    std::process::exit(output.exit_code);
}
