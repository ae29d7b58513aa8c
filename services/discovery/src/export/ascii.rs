//! ASCII tree exporter.
//!
//! Renders the tree as it is discovered: nodes are printed as soon as their
//! profile settles, which works because the exporter shares node handles
//! with the engine mutating them. Name resolution is awaited with a bounded
//! retry; when the budget runs out the remainder is printed as-is so the
//! exporter never wedges the process.

use std::io::{self, Write};
use std::time::Duration;

use async_recursion::async_recursion;
use tokio::time::sleep;

use types::{Node, NodeHandle, NodeWarning, Tree};

#[derive(Debug, Clone)]
pub struct AsciiOptions {
    pub hide_defunct: bool,
    pub max_depth: usize,
    /// Polls to wait for a node to settle before printing it unfinished.
    pub wait_budget: usize,
    pub poll_interval: Duration,
}

impl Default for AsciiOptions {
    fn default() -> Self {
        Self {
            hide_defunct: false,
            max_depth: 100,
            wait_budget: 300,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ancestor {
    last_sibling: bool,
}

/// Export a tree of nodes, live or from a loaded snapshot.
pub async fn export_tree(
    tree: &Tree,
    out: &mut (dyn io::Write + Send),
    options: &AsciiOptions,
) -> io::Result<()> {
    render(tree, vec![], out, options).await
}

#[async_recursion]
async fn render(
    tree: &Tree,
    ancestors: Vec<Ancestor>,
    out: &mut (dyn io::Write + Send),
    options: &AsciiOptions,
) -> io::Result<()> {
    let depth = ancestors.len();
    let mut remaining: Vec<String> = tree.keys().cloned().collect();
    remaining.sort();

    let mut polls_left = options.wait_budget;
    while !remaining.is_empty() {
        let mut made_progress = false;
        let mut idx = 0;
        while idx < remaining.len() {
            let handle = &tree[&remaining[idx]];
            let (defunct, ready) = {
                let node = handle.read();
                (
                    node.warnings.contains(&NodeWarning::Defunct),
                    polls_left == 0 || printable(&node, depth, options.max_depth),
                )
            };
            if defunct && options.hide_defunct {
                remaining.remove(idx);
                made_progress = true;
                continue;
            }
            if !ready {
                idx += 1;
                continue;
            }

            let last_sibling = remaining.len() == 1;
            let children = print_node(handle, &ancestors, last_sibling, out)?;
            remaining.remove(idx);
            made_progress = true;

            let mut child_ancestors = ancestors.clone();
            child_ancestors.push(Ancestor { last_sibling });
            if child_ancestors.len() <= options.max_depth && !children.is_empty() {
                render(&children, child_ancestors, out, options).await?;
            }
        }
        if !remaining.is_empty() && !made_progress {
            polls_left = polls_left.saturating_sub(1);
            sleep(options.poll_interval).await;
        }
    }
    Ok(())
}

/// Print one node line and hand back its children for recursion.
fn print_node(
    handle: &NodeHandle,
    ancestors: &[Ancestor],
    last_sibling: bool,
    out: &mut (dyn io::Write + Send),
) -> io::Result<Tree> {
    let node = handle.read();
    let prefix: String = ancestors
        .iter()
        .map(|a| if a.last_sibling { "    " } else { " │  " })
        .collect();
    let glyph = if ancestors.is_empty() {
        ""
    } else if last_sibling {
        " └──"
    } else {
        " ├──"
    };
    writeln!(
        out,
        "{prefix}{glyph}{}",
        describe(&node)
    )?;
    Ok(node.children.clone())
}

fn describe(node: &Node) -> String {
    let name = node
        .service_name
        .as_deref()
        .or(node.node_name.as_deref())
        .unwrap_or("UNKNOWN");
    let address = node.address.as_deref().unwrap_or("??");
    let mut line = format!(
        " {}:{} {} [{}:{}]",
        node.protocol.ref_, node.protocol_mux, name, node.provider, address
    );
    if node.from_hint {
        line.push_str(" (hint)");
    }
    if !node.warnings.is_empty() {
        let tags: Vec<String> = node.warnings.iter().map(|w| format!("{w:?}")).collect();
        line.push_str(&format!(" (warnings: {})", tags.join(",")));
    }
    if !node.errors.is_empty() {
        let tags: Vec<String> = node.errors.iter().map(|e| format!("{e:?}")).collect();
        line.push_str(&format!(" (errors: {})", tags.join(",")));
    }
    line
}

/// A node is printable once its name is settled and its profile can no
/// longer change: stamped, errored, or past the depth cap.
fn printable(node: &Node, depth: usize, max_depth: usize) -> bool {
    if !node.name_lookup_complete() {
        return false;
    }
    depth >= max_depth || node.profile_timestamp.is_some() || !node.errors.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{NodeError, NodeTransport, PROTOCOL_TCP};

    fn node(address: &str, name: &str) -> Node {
        let nt = NodeTransport::new(
            "stub",
            "ssh",
            PROTOCOL_TCP.clone(),
            "8080",
            Some(address.to_string()),
            false,
            None,
            None,
        );
        let mut n = Node::from_transport(&nt, false);
        n.service_name = Some(name.to_string());
        n.set_profile_timestamp();
        n
    }

    async fn render_to_string(tree: &Tree, options: &AsciiOptions) -> String {
        let mut buf: Vec<u8> = vec![];
        export_tree(tree, &mut buf, options).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn renders_nested_children_with_glyphs() {
        let mut child_a = node("10.0.0.9", "orders-db");
        child_a.warnings.insert(NodeWarning::Defunct);
        let child_b = node("10.0.0.10", "billing");

        let mut parent = node("1.2.3.4", "svc-a");
        parent
            .children
            .insert("a".to_string(), child_a.into_handle());
        parent
            .children
            .insert("b".to_string(), child_b.into_handle());

        let mut tree = Tree::new();
        tree.insert("seed".to_string(), parent.into_handle());

        let rendered = render_to_string(&tree, &AsciiOptions::default()).await;
        assert!(rendered.contains("svc-a [ssh:1.2.3.4]"), "{rendered}");
        assert!(rendered.contains("├── TCP:8080 orders-db"), "{rendered}");
        assert!(rendered.contains("└── TCP:8080 billing"), "{rendered}");
        assert!(rendered.contains("(warnings: Defunct)"), "{rendered}");
    }

    #[tokio::test]
    async fn hide_defunct_prunes_children() {
        let mut defunct = node("10.0.0.9", "orders-db");
        defunct.warnings.insert(NodeWarning::Defunct);
        let mut parent = node("1.2.3.4", "svc-a");
        parent
            .children
            .insert("a".to_string(), defunct.into_handle());

        let mut tree = Tree::new();
        tree.insert("seed".to_string(), parent.into_handle());

        let options = AsciiOptions {
            hide_defunct: true,
            ..AsciiOptions::default()
        };
        let rendered = render_to_string(&tree, &options).await;
        assert!(rendered.contains("svc-a"));
        assert!(!rendered.contains("orders-db"));
    }

    #[tokio::test]
    async fn gives_up_after_wait_budget() {
        // Never settles: no name, no errors, no timestamp.
        let nt = NodeTransport::new(
            "stub",
            "ssh",
            PROTOCOL_TCP.clone(),
            "8080",
            Some("1.2.3.4".to_string()),
            false,
            None,
            None,
        );
        let unfinished = Node::from_transport(&nt, false);
        let mut tree = Tree::new();
        tree.insert("seed".to_string(), unfinished.into_handle());

        let options = AsciiOptions {
            wait_budget: 2,
            poll_interval: Duration::from_millis(1),
            ..AsciiOptions::default()
        };
        let rendered = render_to_string(&tree, &options).await;
        assert!(rendered.contains("UNKNOWN"), "{rendered}");
    }

    #[tokio::test]
    async fn errored_nodes_print_their_tags() {
        let mut errored = node("1.2.3.4", "svc-a");
        errored.profile_timestamp = None;
        errored.errors.insert(NodeError::Cycle);
        let mut tree = Tree::new();
        tree.insert("seed".to_string(), errored.into_handle());

        let rendered = render_to_string(&tree, &AsciiOptions::default()).await;
        assert!(rendered.contains("(errors: Cycle)"), "{rendered}");
    }
}
