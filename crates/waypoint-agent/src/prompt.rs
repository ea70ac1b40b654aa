//! Prompt composition for multi-phase sessions.
//!
//! The system prompt is layered: identity (from the graph, never changes),
//! an optional connected-accounts block, the narrative (derived from the
//! execution path and shared memory), and the focus of the current node.
//! Transition markers are inserted into the conversation at phase
//! boundaries so the model sees the hand-off explicitly.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Local, TimeZone};

use waypoint_core::account::ConnectedAccount;
use waypoint_core::config::AccountsConfig;

use crate::graph::{GraphSpec, NodeSpec};
use crate::memory::SharedMemory;

const NARRATIVE_VALUE_LIMIT: usize = 200;
const MARKER_VALUE_LIMIT: usize = 300;

/// Compose the layered system prompt, stamped with the local time.
pub fn compose_system_prompt(
    identity: Option<&str>,
    focus: Option<&str>,
    narrative: Option<&str>,
    accounts: Option<&str>,
) -> String {
    compose_system_prompt_at(identity, focus, narrative, accounts, &Local::now())
}

/// [`compose_system_prompt`] with an explicit clock.
pub fn compose_system_prompt_at<Tz>(
    identity: Option<&str>,
    focus: Option<&str>,
    narrative: Option<&str>,
    accounts: Option<&str>,
    now: &DateTime<Tz>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    fn present(s: Option<&str>) -> Option<&str> {
        s.filter(|s| !s.is_empty())
    }

    let mut parts: Vec<String> = Vec::new();

    if let Some(identity) = present(identity) {
        parts.push(identity.to_string());
    }
    if let Some(accounts) = present(accounts) {
        parts.push(format!("\n{}", accounts));
    }
    if let Some(narrative) = present(narrative) {
        parts.push(format!(
            "\n--- Context (what has happened so far) ---\n{}",
            narrative
        ));
    }
    if let Some(focus) = present(focus) {
        parts.push(format!("\n--- Current Focus ---\n{}", focus));
    }

    let prompt = parts.join("\n");
    let stamp = format!(
        "Current date and time: {}",
        now.format("%Y-%m-%d %H:%M %Z (UTC%z)")
    );
    if prompt.is_empty() {
        stamp
    } else {
        format!("{}\n\n{}", prompt, stamp)
    }
}

/// The full system prompt for a turn in `node`, as the engine sends it.
pub fn node_system_prompt(
    graph: &GraphSpec,
    node: &NodeSpec,
    memory: &SharedMemory,
    execution_path: &[String],
    accounts: &AccountsConfig,
) -> String {
    let focus = build_focus(node);
    let narrative = build_narrative(memory, execution_path, graph);
    let accounts = build_accounts_prompt(
        &accounts.connected,
        accounts.tool_providers.as_ref(),
        Some(node.tools.as_slice()),
    );
    compose_system_prompt(
        Some(&graph.identity_prompt),
        Some(&focus),
        Some(&narrative),
        Some(&accounts),
    )
}

/// Focus layer for `node`: its prompt, success criteria and output contract.
pub fn build_focus(node: &NodeSpec) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !node.system_prompt.trim().is_empty() {
        sections.push(node.system_prompt.trim_end().to_string());
    }
    if let Some(criteria) = node.success_criteria.as_deref().filter(|c| !c.is_empty()) {
        sections.push(format!("Success criteria:\n{}", criteria));
    }

    let required: Vec<&str> = node.required_outputs().collect();
    if !required.is_empty() {
        sections.push(format!(
            "Required outputs (record each with set_output): {}",
            required.join(", ")
        ));
    }
    if !node.nullable_output_keys.is_empty() {
        sections.push(format!(
            "Optional outputs: {}",
            node.nullable_output_keys.join(", ")
        ));
    }

    sections.join("\n\n")
}

/// Narrative layer: the phases visited so far and the current memory.
/// Empty when there is nothing to report.
pub fn build_narrative(memory: &SharedMemory, execution_path: &[String], graph: &GraphSpec) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !execution_path.is_empty() {
        let phases: Vec<String> = execution_path
            .iter()
            .map(|id| match graph.get_node(id) {
                Some(node) => format!("- {}: {}", node.name, node.description),
                None => format!("- {}", id),
            })
            .collect();
        parts.push(format!("Phases completed:\n{}", phases.join("\n")));
    }

    let lines: Vec<String> = memory
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| format!("- {}: {}", k, truncate(&display_value(v), NARRATIVE_VALUE_LIMIT)))
        .collect();
    if !lines.is_empty() {
        parts.push(format!("Current state:\n{}", lines.join("\n")));
    }

    parts.join("\n\n")
}

/// Hand-off message inserted into the conversation when moving from
/// `previous` to `next`. `data_files` are `(name, size)` pairs from the
/// session's data directory.
pub fn build_transition_marker<I, S>(
    previous: &NodeSpec,
    next: &NodeSpec,
    memory: &SharedMemory,
    cumulative_tools: I,
    data_files: &[(String, u64)],
    adapt_content: Option<&str>,
) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "--- PHASE TRANSITION: {} → {} ---",
        previous.name, next.name
    ));
    sections.push(format!("\nCompleted: {}", previous.name));
    sections.push(format!("  {}", previous.description));

    let outputs: Vec<String> = memory
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| format!("  {}: {}", k, truncate(&display_value(v), MARKER_VALUE_LIMIT)))
        .collect();
    if !outputs.is_empty() {
        sections.push(format!("\nOutputs available:\n{}", outputs.join("\n")));
    }

    if !data_files.is_empty() {
        let files: Vec<String> = data_files
            .iter()
            .map(|(name, size)| format!("  {} ({} bytes)", name, group_thousands(*size)))
            .collect();
        sections.push(format!(
            "\nData files (use load_data to access):\n{}",
            files.join("\n")
        ));
    }

    if let Some(adapt) = adapt_content.filter(|a| !a.is_empty()) {
        sections.push(format!("\n--- Agent Memory ---\n{}", adapt));
    }

    let mut tools: Vec<String> = cumulative_tools
        .into_iter()
        .map(|t| t.as_ref().to_string())
        .collect();
    if !tools.is_empty() {
        tools.sort();
        tools.dedup();
        sections.push(format!("\nAvailable tools: {}", tools.join(", ")));
    }

    sections.push(format!("\nNow entering: {}", next.name));
    sections.push(format!("  {}", next.description));
    sections.push(
        "\nBefore proceeding, briefly reflect: what went well in the \
         previous phase? Are there any gaps or surprises worth noting?"
            .to_string(),
    );
    sections.push("\n--- END TRANSITION ---".to_string());

    sections.join("\n")
}

/// Describe the connected accounts the model may target.
///
/// Without a tool→provider map the block is a flat list. With one, accounts
/// are grouped by provider and each group names the tools that accept the
/// `account` parameter. When `node_tools` is non-empty only providers with at
/// least one of those tools are shown. Returns an empty string when there is
/// nothing to show.
pub fn build_accounts_prompt(
    accounts: &[ConnectedAccount],
    tool_provider_map: Option<&HashMap<String, String>>,
    node_tools: Option<&[String]>,
) -> String {
    if accounts.is_empty() {
        return String::new();
    }

    let Some(tool_provider_map) = tool_provider_map else {
        let mut lines = vec![
            "Connected accounts (use the alias as the `account` parameter \
             when calling tools to target a specific account):"
                .to_string(),
        ];
        for account in accounts {
            lines.push(format!(
                "- {}/{}{}",
                account.provider,
                account.alias,
                identity_detail(account)
            ));
        }
        return lines.join("\n");
    };

    let mut provider_tools: HashMap<&str, Vec<&str>> = HashMap::new();
    for (tool, provider) in tool_provider_map {
        provider_tools
            .entry(provider.as_str())
            .or_default()
            .push(tool.as_str());
    }

    let node_tools = node_tools.filter(|t| !t.is_empty());

    // Providers in order of first appearance.
    let mut grouped: Vec<(&str, Vec<&ConnectedAccount>)> = Vec::new();
    for account in accounts {
        match grouped.iter().position(|(p, _)| *p == account.provider) {
            Some(i) => grouped[i].1.push(account),
            None => grouped.push((account.provider.as_str(), vec![account])),
        }
    }

    let mut sections = vec!["Connected accounts:".to_string()];
    for (provider, list) in grouped {
        let mut tools: Vec<&str> = provider_tools.get(provider).cloned().unwrap_or_default();
        tools.sort_unstable();

        if let Some(node_tools) = node_tools {
            tools.retain(|t| node_tools.iter().any(|n| n.as_str() == *t));
            if tools.is_empty() {
                continue;
            }
        }

        let all_local = list.iter().all(|a| a.is_local());
        let display = display_name(provider);
        if tools.is_empty() {
            sections.push(format!("\n{}:", display));
        } else if all_local {
            sections.push(format!("\n{} (tools: {}):", display, tools.join(", ")));
        } else {
            sections.push(format!(
                "\n{} (use account=\"<alias>\" with: {}):",
                display,
                tools.join(", ")
            ));
        }

        for account in list {
            let tag = if account.is_local() { " [local]" } else { "" };
            sections.push(format!(
                "  - {}/{}{}{}",
                provider,
                account.alias,
                identity_detail(account),
                tag
            ));
        }
    }

    if sections.len() <= 1 {
        return String::new();
    }
    sections.join("\n")
}

fn identity_detail(account: &ConnectedAccount) -> String {
    let parts: Vec<String> = account
        .identity
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// `google_workspace` -> `Google Workspace`.
fn display_name(provider: &str) -> String {
    provider
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut `s` to `limit` characters, marking the cut with `...`.
fn truncate(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    use crate::graph::EdgeSpec;

    fn graph() -> GraphSpec {
        GraphSpec {
            id: "g".into(),
            metadata: Default::default(),
            identity_prompt: "You are thorough.".into(),
            nodes: vec![
                NodeSpec::new("intake", "Intake").with_description("Collect the request"),
                NodeSpec::new("research", "Research").with_description("Find sources"),
            ],
            edges: vec![EdgeSpec::always("intake", "research")],
            entry_points: BTreeMap::from([("default".to_string(), "intake".to_string())]),
            terminal_nodes: vec![],
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 9, 5, 0).unwrap()
    }

    #[test]
    fn test_compose_layers_in_order() {
        let prompt = compose_system_prompt_at(
            Some("IDENTITY"),
            Some("FOCUS"),
            Some("NARRATIVE"),
            Some("ACCOUNTS"),
            &fixed_now(),
        );
        assert_eq!(
            prompt,
            "IDENTITY\n\nACCOUNTS\n\n--- Context (what has happened so far) ---\nNARRATIVE\n\n\
             --- Current Focus ---\nFOCUS\n\nCurrent date and time: 2025-03-04 09:05 UTC (UTC+0000)"
        );
    }

    #[test]
    fn test_compose_omits_empty_sections() {
        let prompt = compose_system_prompt_at(Some("ID"), None, Some(""), None, &fixed_now());
        assert_eq!(prompt, "ID\n\nCurrent date and time: 2025-03-04 09:05 UTC (UTC+0000)");

        let bare = compose_system_prompt_at(None, None, None, None, &fixed_now());
        assert_eq!(bare, "Current date and time: 2025-03-04 09:05 UTC (UTC+0000)");
    }

    #[test]
    fn test_compose_idempotent_modulo_timestamp() {
        let a = compose_system_prompt(Some("ID"), Some("F"), Some("N"), None);
        let b = compose_system_prompt(Some("ID"), Some("F"), Some("N"), None);
        let strip = |s: &str| s.rsplit_once("\n\n").map(|(head, _)| head.to_string());
        assert_eq!(strip(&a), strip(&b));
        assert!(a.contains("Current date and time: "));
    }

    #[test]
    fn test_narrative() {
        let graph = graph();
        let mut memory = SharedMemory::new();
        memory.write("topic", json!("rust"), None);
        memory.write("skipped", serde_json::Value::Null, Some("intake"));

        let narrative = build_narrative(
            &memory,
            &["intake".to_string(), "ghost".to_string()],
            &graph,
        );
        assert_eq!(
            narrative,
            "Phases completed:\n- Intake: Collect the request\n- ghost\n\nCurrent state:\n- topic: rust"
        );
        assert_eq!(build_narrative(&SharedMemory::new(), &[], &graph), "");
    }

    #[test]
    fn test_narrative_truncates_long_values() {
        let mut memory = SharedMemory::new();
        memory.write("long", json!("x".repeat(250)), Some("a"));
        memory.write("exact", json!("y".repeat(200)), Some("a"));
        let narrative = build_narrative(&memory, &[], &graph());

        assert!(narrative.contains(&format!("- long: {}...", "x".repeat(200))));
        assert!(!narrative.contains(&"x".repeat(201)));
        assert!(narrative.contains(&format!("- exact: {}\n", "y".repeat(200))));
    }

    #[test]
    fn test_focus_includes_contract() {
        let node = NodeSpec::new("r", "Report")
            .with_prompt("Write the report.")
            .with_success_criteria("A report exists.")
            .with_outputs(&["report", "appendix"])
            .with_nullable_outputs(&["appendix"]);
        assert_eq!(
            build_focus(&node),
            "Write the report.\n\nSuccess criteria:\nA report exists.\n\n\
             Required outputs (record each with set_output): report\n\nOptional outputs: appendix"
        );
    }

    #[test]
    fn test_transition_marker() {
        let files = vec![("a.txt".to_string(), 2), ("b.json".to_string(), 1234)];
        let graph = graph();
        let mut memory = SharedMemory::new();
        memory.write("topic", json!("rust"), Some("intake"));

        let marker = build_transition_marker(
            graph.node("intake").unwrap(),
            graph.node("research").unwrap(),
            &memory,
            ["web_search", "load_data"],
            &files,
            Some("User prefers bullet points."),
        );
        let expected = "--- PHASE TRANSITION: Intake → Research ---\n\
\n\
Completed: Intake\n  Collect the request\n\
\n\
Outputs available:\n  topic: rust\n\
\n\
Data files (use load_data to access):\n  a.txt (2 bytes)\n  b.json (1,234 bytes)\n\
\n\
--- Agent Memory ---\nUser prefers bullet points.\n\
\n\
Available tools: load_data, web_search\n\
\n\
Now entering: Research\n  Find sources\n\
\n\
Before proceeding, briefly reflect: what went well in the previous phase? Are there any gaps or surprises worth noting?\n\
\n\
--- END TRANSITION ---";
        assert_eq!(marker, expected);
    }

    #[test]
    fn test_transition_marker_minimal() {
        let graph = graph();
        let marker = build_transition_marker(
            graph.node("intake").unwrap(),
            graph.node("research").unwrap(),
            &SharedMemory::new(),
            Vec::<String>::new(),
            &[],
            None,
        );
        assert!(!marker.contains("Outputs available"));
        assert!(!marker.contains("Available tools"));
        assert!(!marker.contains("Data files"));
        assert!(marker.ends_with("--- END TRANSITION ---"));
    }

    fn accounts() -> Vec<ConnectedAccount> {
        vec![
            ConnectedAccount::new("google", "work").with_identity("email", "me@work.com"),
            ConnectedAccount::new("slack", "team"),
            ConnectedAccount::new("google", "personal").with_identity("email", ""),
            ConnectedAccount::new("brave_search", "default").local(),
        ]
    }

    #[test]
    fn test_accounts_flat() {
        let block = build_accounts_prompt(&accounts()[..2], None, None);
        assert_eq!(
            block,
            "Connected accounts (use the alias as the `account` parameter when calling tools \
             to target a specific account):\n- google/work (email: me@work.com)\n- slack/team"
        );
        assert_eq!(build_accounts_prompt(&[], None, None), "");
    }

    #[test]
    fn test_accounts_structured() {
        let map = HashMap::from([
            ("gmail_send".to_string(), "google".to_string()),
            ("calendar_list".to_string(), "google".to_string()),
            ("web_search".to_string(), "brave_search".to_string()),
        ]);
        let block = build_accounts_prompt(&accounts(), Some(&map), None);
        assert_eq!(
            block,
            "Connected accounts:\n\
             \nGoogle (use account=\"<alias>\" with: calendar_list, gmail_send):\n  \
             - google/work (email: me@work.com)\n  - google/personal\n\
             \nSlack:\n  - slack/team\n\
             \nBrave Search (tools: web_search):\n  - brave_search/default [local]"
        );
    }

    #[test]
    fn test_accounts_filtered_by_node_tools() {
        let map = HashMap::from([
            ("gmail_send".to_string(), "google".to_string()),
            ("calendar_list".to_string(), "google".to_string()),
        ]);
        let tools = vec!["gmail_send".to_string()];
        let block = build_accounts_prompt(&accounts(), Some(&map), Some(&tools));
        assert_eq!(
            block,
            "Connected accounts:\n\
             \nGoogle (use account=\"<alias>\" with: gmail_send):\n  \
             - google/work (email: me@work.com)\n  - google/personal"
        );

        let unrelated = vec!["load_data".to_string()];
        assert_eq!(build_accounts_prompt(&accounts(), Some(&map), Some(&unrelated)), "");
    }

    #[test]
    fn test_helpers() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1234), "1,234");
        assert_eq!(group_thousands(1234567), "1,234,567");
        assert_eq!(display_name("google_workspace"), "Google Workspace");
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 2), "hi");
    }
}
