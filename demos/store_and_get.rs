use kademlia_engine::{DhtConfig, Key, Node};
use sha3::{Digest, Sha3_256};
use std::error::Error;

fn get_key(key: &str) -> Key {
    let hash = Sha3_256::digest(key.as_bytes());
    let mut data = Key::MIN.0;
    let len = data.len();
    data.copy_from_slice(&hash[..len]);
    Key::new(data)
}

fn main() -> Result<(), Box<dyn Error>> {
    let seed = Node::new("127.0.0.1:8080", DhtConfig::default())?;
    let mut nodes = Vec::new();
    for port in 8081..8086 {
        let node = Node::new(&format!("127.0.0.1:{}", port), DhtConfig::default())?;
        node.bootstrap(seed.addr()).get()?;
        nodes.push(node);
    }

    let key = get_key("Hello");
    let result = nodes[0].put(key, b"World".to_vec()).get()?;
    println!("stored on {} contacts", result.stored_count());

    let values = nodes[4].get(key).get()?;
    assert_eq!(values[0].payload, b"World".to_vec());

    for node in nodes.iter().chain(Some(&seed)) {
        node.kill();
    }
    Ok(())
}
