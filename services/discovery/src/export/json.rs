//! JSON exporter: the `{args, tree}` snapshot document, pretty-printed.

use std::io::{self, Write};

use types::Tree;

use crate::settings::DiscoverySettings;
use crate::snapshot::Snapshot;

pub fn export_json(
    settings: &DiscoverySettings,
    tree: &Tree,
    out: &mut dyn io::Write,
) -> anyhow::Result<()> {
    let snapshot = Snapshot::capture(settings, tree);
    serde_json::to_writer_pretty(&mut *out, &snapshot)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Node, NodeTransport, PROTOCOL_TCP};

    #[test]
    fn emits_args_and_tree() {
        let nt = NodeTransport::new(
            "stub",
            "ssh",
            PROTOCOL_TCP.clone(),
            "seed",
            Some("1.2.3.4".to_string()),
            false,
            None,
            None,
        );
        let node = Node::from_transport(&nt, false);
        let mut tree = Tree::new();
        tree.insert(nt.node_ref(), node.into_handle());

        let mut buf: Vec<u8> = vec![];
        export_json(&DiscoverySettings::default(), &tree, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("args").is_some());
        assert!(value["tree"].get("TCP_1.2.3.4_seed").is_some());
    }
}
