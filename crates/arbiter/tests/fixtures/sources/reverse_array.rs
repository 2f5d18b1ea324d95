use std::io::{self, BufRead};

/// Split a JSON array of strings into its raw string literals
fn literals(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut items = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += if bytes[i] == b'\\' { 2 } else { 1 };
            }
            items.push(&line[start..=i.min(bytes.len() - 1)]);
        }
        i += 1;
    }
    items
}

fn main() {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).unwrap();
    let mut items = literals(line.trim());
    items.reverse();
    println!("[{}]", items.join(","));
}
