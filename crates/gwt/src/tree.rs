//! Text tree of detected projects and their processes.

use gwtd_types::{BindingState, ProjectStatus, Role, StatusResult};
use std::fmt::Write as _;

/// One row of the tree. Project rows point into the status view by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    Action {
        title: &'static str,
        command: String,
    },
    Folder {
        title: &'static str,
        children: Vec<TreeNode>,
    },
    Project {
        index: usize,
        children: Vec<TreeNode>,
    },
    RoleStatus {
        project: usize,
        role: Role,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub label: String,
    pub icon: &'static str,
    pub command: Option<String>,
}

impl TreeNode {
    pub fn render(&self, view: &StatusResult) -> Rendered {
        match self {
            TreeNode::Action { title, command } => Rendered {
                label: (*title).to_string(),
                icon: ">",
                command: Some(command.clone()),
            },
            TreeNode::Folder { title, children } => Rendered {
                label: format!("{title} ({})", children.len()),
                icon: "+",
                command: None,
            },
            TreeNode::Project { index, .. } => {
                let Some(status) = view.projects.get(*index) else {
                    return missing();
                };
                let mut label = format!(
                    "{} ({})",
                    status.project.name, status.project.plugin_version
                );
                if let Some(port) = status.discovered_port {
                    let _ = write!(label, " port {port}");
                }
                Rendered {
                    label,
                    icon: "#",
                    command: Some(format!("gwt status {}", quote(&status.project.key))),
                }
            }
            TreeNode::RoleStatus { project, role } => {
                let Some(status) = view.projects.get(*project) else {
                    return missing();
                };
                render_role(status, *role)
            }
        }
    }

    pub fn children(&self) -> &[TreeNode] {
        match self {
            TreeNode::Folder { children, .. } | TreeNode::Project { children, .. } => children,
            TreeNode::Action { .. } | TreeNode::RoleStatus { .. } => &[],
        }
    }
}

fn render_role(status: &ProjectStatus, role: Role) -> Rendered {
    let key = quote(&status.project.key);
    let Some(role_status) = status.role(role) else {
        return missing();
    };
    let state = role_status.state;
    let mut label = format!("{} [{}]", role.label(), state.as_str());
    if let Some(pid) = role_status.pid {
        let _ = write!(label, " pid {pid}");
    }
    let (icon, command) = match state {
        BindingState::Idle => ("o", format!("gwt start {role} {key}")),
        BindingState::Starting => ("~", format!("gwt stop {role} {key}")),
        BindingState::Running => ("*", format!("gwt stop {role} {key}")),
        BindingState::Disconnected => ("?", format!("gwt resolve {key} {role} check-port")),
    };
    Rendered {
        label,
        icon,
        command: Some(command),
    }
}

fn missing() -> Rendered {
    Rendered {
        label: "(gone)".to_string(),
        icon: "!",
        command: None,
    }
}

fn quote(raw: &str) -> String {
    if raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "/._-".contains(ch))
    {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', "'\\''"))
    }
}

/// Top-level actions, then GWT and Jetty folders.
pub fn build_tree(view: &StatusResult) -> Vec<TreeNode> {
    let mut gwt = Vec::new();
    let mut jetty = Vec::new();
    for (index, status) in view.projects.iter().enumerate() {
        let gwt_roles: Vec<TreeNode> = [Role::Compile, Role::Devmode, Role::Codeserver]
            .into_iter()
            .filter(|role| status.role(*role).is_some())
            .map(|role| TreeNode::RoleStatus {
                project: index,
                role,
            })
            .collect();
        if !gwt_roles.is_empty() {
            gwt.push(TreeNode::Project {
                index,
                children: gwt_roles,
            });
        }
        if status.role(Role::Jetty).is_some() {
            jetty.push(TreeNode::Project {
                index,
                children: vec![TreeNode::RoleStatus {
                    project: index,
                    role: Role::Jetty,
                }],
            });
        }
    }

    let mut nodes = vec![
        TreeNode::Action {
            title: "Refresh projects",
            command: "gwt refresh".to_string(),
        },
        TreeNode::Action {
            title: "Stop all processes",
            command: "gwt stop-all".to_string(),
        },
    ];
    if !gwt.is_empty() {
        nodes.push(TreeNode::Folder {
            title: "GWT projects",
            children: gwt,
        });
    }
    if !jetty.is_empty() {
        nodes.push(TreeNode::Folder {
            title: "Jetty projects",
            children: jetty,
        });
    }
    nodes
}

pub fn format_tree(view: &StatusResult) -> String {
    let mut output = String::new();
    for node in build_tree(view) {
        write_node(&mut output, &node, view, 0);
    }
    for prompt in &view.prompts {
        let actions: Vec<&str> = prompt.actions.iter().map(|action| action.as_str()).collect();
        let _ = writeln!(
            output,
            "! {} (actions: {})",
            prompt.message,
            actions.join(", ")
        );
    }
    output
}

fn write_node(output: &mut String, node: &TreeNode, view: &StatusResult, depth: usize) {
    let rendered = node.render(view);
    let indent = "  ".repeat(depth);
    let _ = write!(output, "{indent}{} {}", rendered.icon, rendered.label);
    if let Some(command) = &rendered.command {
        let _ = write!(output, "    $ {command}");
    }
    output.push('\n');
    for child in node.children() {
        write_node(output, child, view, depth + 1);
    }
}
