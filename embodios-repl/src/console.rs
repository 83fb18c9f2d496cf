//! Stdio-backed `Console`: the hosted stand-in for the console external
//! collaborator (a kernel would wire this to its own text-mode or
//! serial output).

use std::io::{self, Write};

pub trait Console {
    fn write_str(&mut self, s: &str);
    fn write_line(&mut self, s: &str) {
        self.write_str(s);
        self.write_str("\n");
    }
    fn read_line(&mut self) -> Option<String>;
}

pub struct StdioConsole;

impl Console for StdioConsole {
    fn write_str(&mut self, s: &str) {
        print!("{s}");
        let _ = io::stdout().flush();
    }

    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches('\n').trim_end_matches('\r').to_string()),
            Err(_) => None,
        }
    }
}
