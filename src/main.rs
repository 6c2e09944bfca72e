fn main() {
    if let Err(err) = plan_canvas::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
