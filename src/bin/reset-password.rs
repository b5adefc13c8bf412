use std::env;

use firme_backend::{
    config::config,
    db::{self, USERS_TABLE},
    routes::auth::hash_password,
};

const USAGE: &str = "Usage: cargo run --bin reset-password <USERNAME> <PASSWORD> [--force-change]";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let force_change = args.iter().any(|a| a == "--force-change");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();
    let (username, password) = match positional.as_slice() {
        [username, password] => (username.trim().to_string(), password.to_string()),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    if username.is_empty() || password.chars().count() < 10 {
        eprintln!("Username must be non-empty and the password at least 10 characters long.");
        std::process::exit(1);
    }

    let pool = match db::init_pool(None).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Cannot connect to the database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = db::run_migrations(&pool, &config().tables).await {
        eprintln!("Cannot prepare the schema: {}", e);
        std::process::exit(1);
    }

    let hashed = match hash_password(password).await {
        Ok(hashed) => hashed,
        Err(e) => {
            eprintln!("Error hashing password: {}", e);
            std::process::exit(1);
        }
    };

    let result = sqlx::query(&format!(
        "INSERT INTO {USERS_TABLE} (username, password_hash, must_change_password) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (username) DO UPDATE SET password_hash = EXCLUDED.password_hash, \
         must_change_password = EXCLUDED.must_change_password, updated_at = now()"
    ))
    .bind(&username)
    .bind(&hashed)
    .bind(force_change)
    .execute(pool.as_ref())
    .await;

    match result {
        Ok(_) => {
            println!("\nPassword updated for: {}", username);
            if force_change {
                println!("A new password will be required at the next login.");
            }
        }
        Err(e) => {
            eprintln!("Error updating user: {}", e);
            std::process::exit(1);
        }
    }
}
