use std::io::{self, BufRead};

fn main() {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).unwrap();
    let reversed: String = line.trim_end_matches('\n').chars().rev().collect();
    println!("{reversed}");
}
