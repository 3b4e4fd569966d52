use std::process;

fn main() {
    let args = vessel::cli::parse();

    if let Err(e) = vessel::cli::commands::dispatch(args) {
        eprintln!("vessel: {e:#}");
        process::exit(1);
    }
}
