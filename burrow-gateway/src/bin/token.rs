//! Token generation utility.
//!
//! Mints authentication tokens for burrow agents.

use burrow_core::HmacValidator;
use clap::Parser;

/// Generate authentication tokens for burrow agents.
#[derive(Parser, Debug)]
#[command(name = "burrow-token")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The authentication secret (hex-encoded)
    /// If not provided, a new secret will be generated
    #[arg(short, long, env = "BURROW_AUTH_SECRET")]
    secret: Option<String>,

    /// Number of tokens to generate
    #[arg(short, long, default_value = "1")]
    count: usize,
}

fn main() {
    let args = Args::parse();

    let validator = match args.secret.as_deref() {
        Some(secret) => match HmacValidator::from_hex(secret) {
            Ok(validator) => validator,
            Err(e) => {
                eprintln!("Error: invalid secret - {}", e);
                std::process::exit(1);
            }
        },
        None => {
            let validator = HmacValidator::default();
            println!("Generated new secret: {}", validator.secret_hex());
            println!("Save this secret to use with burrow-gateway --auth-secret");
            println!();
            validator
        }
    };

    println!("Generated token(s):");
    for i in 0..args.count {
        let token = validator.generate_token();
        if args.count > 1 {
            println!("  {}: {}", i + 1, token.token);
        } else {
            println!("  {}", token.token);
        }
    }

    println!();
    println!("Use this token with burrow-agent --token <TOKEN>");
}
