//! Build script for fibra-runtime
//!
//! Generates `OUT_DIR/fibra_defaults.rs`:
//! 1. Start from the library defaults below
//! 2. If `FIBRA_CONFIG_RS` names a file, read `pub const NAME: TYPE = VALUE;`
//!    lines from it and let them win
//! 3. Emit one `pub const` per parameter
//!
//! A user file only needs the values it changes.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam { name: "SCHEDULING_GROUPS", rust_type: "usize", default_value: "1" },
    ConfigParam { name: "WORKERS_PER_GROUP", rust_type: "usize", default_value: "4" },
    ConfigParam { name: "MAX_FIBERS", rust_type: "usize", default_value: "1_048_576" },
    ConfigParam { name: "STACK_SIZE", rust_type: "usize", default_value: "128 * 1024" },
    ConfigParam { name: "ENTITY_POOL_SIZE", rust_type: "usize", default_value: "1024" },
    ConfigParam { name: "LOCAL_QUEUE_CAPACITY", rust_type: "usize", default_value: "256" },
    ConfigParam { name: "CROSS_GROUP_STEAL_EVERY", rust_type: "u32", default_value: "16" },
    ConfigParam { name: "IDLE_SPINS", rust_type: "u32", default_value: "64" },
    ConfigParam { name: "PARK_TIMEOUT_MS", rust_type: "u64", default_value: "100" },
    ConfigParam { name: "TIMER_MAX_SLEEP_MS", rust_type: "u64", default_value: "100" },
    ConfigParam { name: "SHUTDOWN_GRACE_MS", rust_type: "u64", default_value: "5000" },
    ConfigParam { name: "ENABLE_REACTOR", rust_type: "bool", default_value: "true" },
    ConfigParam { name: "REACTOR_EVENTS", rust_type: "usize", default_value: "256" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("fibra_defaults.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("FIBRA_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);
        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=fibra: using custom config {}", user_path);
            }
            Err(e) => {
                println!("cargo:warning=fibra: cannot read FIBRA_CONFIG_RS ({}): {}", user_path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed=FIBRA_CONFIG_RS");

    fs::write(&dest_path, generate_config(&config)).expect("failed to write merged config");
}

fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=fibra: unknown config parameter {}", name),
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` -> `(NAME, VALUE)`
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let colon = rest.find(':')?;
    let eq = rest.find('=')?;
    let semi = rest.rfind(';').unwrap_or(rest.len());
    if eq < colon || semi < eq {
        return None;
    }
    Some((rest[..colon].trim().to_string(), rest[eq + 1..semi].trim().to_string()))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::from("// Generated by fibra-runtime build.rs - do not edit\n\n");
    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    output
}
