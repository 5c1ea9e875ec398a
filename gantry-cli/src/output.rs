// Output formatting helpers for CLI commands
// Progress goes to stderr; step output and plans go to stdout

use std::sync::OnceLock;

/// ANSI colour is disabled when `NO_COLOR` is set to anything non-empty
fn color_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").map_or(true, |v| v.is_empty()))
}

fn paint(code: &str, text: &str) -> String {
    if color_enabled() {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

/// Print a status message: "  Validating ci.yml"
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint("1;36", &format!("{:>12}", action)), message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("{} {}", paint("1;32", "  \u{2713}"), message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("{} {}", paint("1;31", "  \u{2717}"), message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("{} {}", paint("32", "  \u{2713}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint("33", "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint("1;31", "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint("36", "  i"), message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("{}", paint("2", message));
}

pub fn dim_success(message: &str) {
    eprintln!("{}", paint("32", message));
}

pub fn dim_failure(message: &str) {
    eprintln!("{}", paint("31", message));
}

/// Print step output (indented)
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Print step error output (indented, red)
pub fn step_error(line: &str) {
    eprintln!("{}", paint("31", &format!("        | {}", line)));
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("{}", paint("1", &format!("==> {}", message)));
}
