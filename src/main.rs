#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::error::Error;
use std::io;

use sha3::{Digest, Sha3_256};
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
};

use kademlia_engine::{DhtConfig, Key, Node};

fn get_key(key: &str) -> Key {
    let hash = Sha3_256::digest(key.as_bytes());
    let mut data = Key::MIN.0;
    let len = data.len();
    data.copy_from_slice(&hash[..len]);
    Key::new(data)
}

fn spawn(port: usize, seed: Option<&Node>) -> Result<Node, Box<dyn Error>> {
    let node = Node::new(&format!("127.0.0.1:{}", port), DhtConfig::default())?;
    if let Some(seed) = seed {
        let result = node.bootstrap(seed.addr()).get()?;
        info!(
            "{} - Bootstrapped from {} with {} contacts",
            node.addr(),
            result.seed.addr,
            node.contacts().len()
        );
    }
    Ok(node)
}

fn main() -> Result<(), Box<dyn Error>> {
    let loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    CombinedLogger::init(loggers)?;

    let mut node_map = HashMap::new();
    let seed = spawn(8900, None)?;
    node_map.insert(0, seed.clone());
    let mut id = 1;
    while id < 20 {
        node_map.insert(id, spawn(8900 + id, Some(&seed))?);
        id += 1;
    }

    let input = io::stdin();
    loop {
        let mut buffer = String::new();
        println!("Ready for input!");
        if input.read_line(&mut buffer).map(|read| read == 0).unwrap_or(true) {
            break;
        }
        let args: Vec<&str> = buffer.trim_end().split(' ').collect();
        let node = match args.get(1).and_then(|index| index.parse::<usize>().ok()) {
            Some(index) => match node_map.get(&index) {
                Some(node) => node.clone(),
                None => {
                    warn!("No node with index {}", index);
                    continue;
                },
            },
            None => {
                warn!("Usage: new|store|get|stats|kill <index> [key] [value]");
                continue;
            },
        };
        match (args[0], args.get(2), args.get(3)) {
            ("new", _, _) => match spawn(8900 + id, Some(&node)) {
                Ok(new_node) => {
                    info!("Spawned node {} at {}", id, new_node.addr());
                    node_map.insert(id, new_node);
                    id += 1;
                },
                Err(err) => warn!("Could not spawn node: {}", err),
            },
            ("store", Some(key), Some(value)) => {
                match node.put(get_key(key), value.as_bytes().to_vec()).get() {
                    Ok(result) => info!("Stored {} on {} contacts", key, result.stored_count()),
                    Err(err) => warn!("Could not store {}: {}", key, err),
                }
            },
            ("get", Some(key), _) => match node.get(get_key(key)).get() {
                Ok(values) => {
                    for value in values {
                        info!("{} => {}", key, String::from_utf8_lossy(&value.payload));
                    }
                },
                Err(err) => warn!("Could not get {}: {}", key, err),
            },
            ("stats", _, _) => {
                for (name, count) in node.stats().snapshot() {
                    info!("{}: {}", name, count);
                }
            },
            ("kill", _, _) => node.kill(),
            _ => warn!("Unknown command {}", args[0]),
        }
    }
    Ok(())
}
