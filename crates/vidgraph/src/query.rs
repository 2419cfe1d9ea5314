//! Graph lookups for the `vidgraph graph …` commands.
//!
//! The HTTP server reads the same [`GraphStore`] methods and serializes the
//! results as JSON; these functions print them for a terminal.

use anyhow::Result;

use vidgraph_core::delta::{Properties, PropertyValue};
use vidgraph_core::store::{GraphEdge, GraphNode};

use crate::config::Config;
use crate::services::Services;

fn format_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::Int(i) => i.to_string(),
        PropertyValue::Float(f) => f.to_string(),
        PropertyValue::Text(s) => format!("{:?}", s),
    }
}

fn format_properties(props: &Properties) -> String {
    let parts: Vec<String> = props
        .iter()
        .map(|(k, v)| format!("{}={}", k, format_value(v)))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

fn print_node(node: &GraphNode) {
    println!(
        "({}:{}) {}",
        node.natural_key,
        node.label,
        format_properties(&node.properties)
    );
}

fn print_edge(edge: &GraphEdge) {
    if edge.properties.is_empty() {
        println!("{} -[{}]-> {}", edge.from_key, edge.relation_type, edge.to_key);
    } else {
        println!(
            "{} -[{}]-> {} {}",
            edge.from_key,
            edge.relation_type,
            edge.to_key,
            format_properties(&edge.properties)
        );
    }
}

/// `vidgraph graph show`: counts plus a bounded snapshot.
pub async fn run_graph_show(config: &Config, limit: usize) -> Result<()> {
    let services = Services::open(config).await?;
    let stats = services.graph.stats().await?;
    let snapshot = services.graph.snapshot(limit).await?;

    println!(
        "Graph: {} nodes, {} relationships (showing up to {} nodes)",
        stats.nodes, stats.relationships, limit
    );
    println!();
    println!("--- Nodes ({}) ---", snapshot.nodes.len());
    for node in &snapshot.nodes {
        print_node(node);
    }
    println!();
    println!("--- Relationships ({}) ---", snapshot.relationships.len());
    for edge in &snapshot.relationships {
        print_edge(edge);
    }

    services.close().await;
    Ok(())
}

/// `vidgraph graph node <key>`.
pub async fn run_graph_node(config: &Config, key: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let node = services.graph.get_node(key).await?;
    services.close().await;

    let node = match node {
        Some(n) => n,
        None => {
            eprintln!("Error: node not found: {}", key);
            std::process::exit(1);
        }
    };

    println!("--- Node ---");
    println!("key:   {}", node.natural_key);
    println!("label: {}", node.label);
    for (name, value) in &node.properties {
        println!("  {} = {}", name, format_value(value));
    }
    Ok(())
}

/// `vidgraph graph neighbors <key>`: every relationship touching the node.
pub async fn run_graph_neighbors(config: &Config, key: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let edges = services.graph.neighbors(key).await?;
    services.close().await;

    if edges.is_empty() {
        println!("No relationships for {}.", key);
        return Ok(());
    }
    println!("--- Relationships of {} ({}) ---", key, edges.len());
    for edge in &edges {
        print_edge(edge);
    }
    Ok(())
}

/// `vidgraph graph label <label> [--property P --value V]`.
pub async fn run_graph_label(
    config: &Config,
    label: &str,
    filter: Option<(&str, &str)>,
    limit: usize,
) -> Result<()> {
    let services = Services::open(config).await?;
    let nodes = match filter {
        Some((property, value)) => {
            services.graph.nodes_by_property(label, property, value, limit).await
        }
        None => services.graph.nodes_by_label(label, limit).await,
    };
    services.close().await;
    let nodes = nodes?;

    println!("--- {} nodes ({}) ---", label, nodes.len());
    for node in &nodes {
        print_node(node);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_render_sorted_and_quoted() {
        let mut props = Properties::new();
        props.insert("name".to_string(), PropertyValue::Text("webm".to_string()));
        props.insert("channels".to_string(), PropertyValue::Int(2));
        props.insert("default".to_string(), PropertyValue::Bool(true));
        assert_eq!(
            format_properties(&props),
            r#"{channels=2, default=true, name="webm"}"#
        );
    }

    #[test]
    fn empty_properties() {
        assert_eq!(format_properties(&Properties::new()), "{}");
    }
}
