use wardend::commands;

fn output_header() -> &'static str {
    "wardend\nwardend is a personal assistant host: per-group wake queue, sandboxed agent sessions, and a file-based task protocol."
}

fn print_header() {
    println!("{}\n", output_header());
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    // The supervisor verb runs detached with stdio closed; skip the banner.
    if args.first().map(String::as_str) != Some("__supervisor") {
        print_header();
    }
    let output = commands::run_cli(args)?;
    println!("{output}");
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
