use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gwtd_types::{ProjectDescriptor, Role};
use regex::Regex;
use tracing::{debug, warn};

const SKIPPED_DIRS: &[&str] = &["target", ".git", "node_modules"];

const JETTY_PLUGINS: &[&str] = &[
    "jetty-maven-plugin",
    "jetty-ee8-maven-plugin",
    "jetty-ee9-maven-plugin",
    "jetty-ee10-maven-plugin",
];

/// Name used for a GWT project whose pom does not declare `<moduleName>`.
pub const ROOT_POM_NAME: &str = "Root POM";

/// Produces the current project list. Must be idempotent.
pub trait Detector {
    fn detect(&self) -> Result<Vec<ProjectDescriptor>>;
}

/// Finds `pom.xml` files that configure the GWT or Jetty Maven plugins.
pub struct PomDetector {
    roots: Vec<PathBuf>,
    patterns: PomPatterns,
}

struct PomPatterns {
    gwt_version: Regex,
    jetty_version: Regex,
    module_name: Regex,
    devmode_args: Regex,
    codeserver_args: Regex,
    port_arg: Regex,
    codeserver_port_arg: Regex,
}

impl PomPatterns {
    fn compile() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("invalid pom pattern: {pattern}"))
        };
        Ok(Self {
            gwt_version: build(
                r"<artifactId>gwt-maven-plugin</artifactId>\s*<version>([^<]+)</version>",
            )?,
            jetty_version: build(
                r"<artifactId>jetty(?:-ee\d+)?-maven-plugin</artifactId>\s*<version>([^<]+)</version>",
            )?,
            module_name: build(r"<moduleName>([^<]+)</moduleName>")?,
            devmode_args: build(r"(?s)<devmodeArgs>(.*?)</devmodeArgs>")?,
            codeserver_args: build(r"(?s)<codeserverArgs>(.*?)</codeserverArgs>")?,
            port_arg: build(r"<arg>\s*-port\s*</arg>\s*<arg>\s*(\d+)\s*</arg>")?,
            codeserver_port_arg: build(
                r"<arg>\s*-codeserverPort\s*</arg>\s*<arg>\s*(\d+)\s*</arg>",
            )?,
        })
    }
}

impl PomDetector {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self> {
        Ok(Self {
            roots,
            patterns: PomPatterns::compile()?,
        })
    }

    /// Builds a descriptor when the pom configures a supported plugin.
    pub fn parse_pom(&self, key: &str, text: &str) -> Option<ProjectDescriptor> {
        let patterns = &self.patterns;
        let has_gwt = text.contains("<artifactId>gwt-maven-plugin</artifactId>");
        let has_jetty = JETTY_PLUGINS
            .iter()
            .any(|plugin| text.contains(&format!("<artifactId>{plugin}</artifactId>")));
        if !has_gwt && !has_jetty {
            return None;
        }

        let mut roles = Vec::new();
        let mut plugin_version = None;
        let mut name = None;
        let mut devmode_port = None;
        let mut codeserver_port = None;

        if has_gwt {
            roles.extend([Role::Compile, Role::Devmode, Role::Codeserver]);
            plugin_version = capture(&patterns.gwt_version, text);
            name = Some(
                capture(&patterns.module_name, text).unwrap_or_else(|| ROOT_POM_NAME.to_string()),
            );

            let devmode_block = capture(&patterns.devmode_args, text);
            devmode_port = devmode_block
                .as_deref()
                .and_then(|block| capture_port(&patterns.port_arg, block));
            codeserver_port = capture(&patterns.codeserver_args, text)
                .as_deref()
                .and_then(|block| capture_port(&patterns.port_arg, block))
                .or_else(|| {
                    devmode_block
                        .as_deref()
                        .and_then(|block| capture_port(&patterns.codeserver_port_arg, block))
                });
        }
        if has_jetty {
            roles.push(Role::Jetty);
            if plugin_version.is_none() {
                plugin_version = capture(&patterns.jetty_version, text);
            }
        }

        let name = name.unwrap_or_else(|| directory_name(key));
        Some(ProjectDescriptor {
            key: key.to_string(),
            name,
            plugin_version: plugin_version.unwrap_or_else(|| "unknown".to_string()),
            codeserver_port,
            devmode_port,
            roles,
        })
    }
}

impl Detector for PomDetector {
    fn detect(&self) -> Result<Vec<ProjectDescriptor>> {
        let mut poms = Vec::new();
        for root in &self.roots {
            collect_pom_files(root, &mut poms)
                .with_context(|| format!("failed to scan {}", root.display()))?;
        }
        poms.sort();

        let mut projects = Vec::new();
        for pom in poms {
            let text = match fs::read_to_string(&pom) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to read {}: {err}", pom.display());
                    continue;
                }
            };
            let key = fs::canonicalize(&pom)
                .unwrap_or_else(|_| pom.clone())
                .to_string_lossy()
                .to_string();
            if let Some(project) = self.parse_pom(&key, &text) {
                debug!("detected '{}' at {key}", project.name);
                projects.push(project);
            }
        }
        Ok(projects)
    }
}

fn collect_pom_files(dir: &Path, poms: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let skipped = entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIPPED_DIRS.contains(&name));
            if !skipped {
                if let Err(err) = collect_pom_files(&path, poms) {
                    debug!("skipping {}: {err:#}", path.display());
                }
            }
        } else if file_type.is_file() && entry.file_name() == "pom.xml" {
            poms.push(path);
        }
    }
    Ok(())
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn capture_port(pattern: &Regex, text: &str) -> Option<u16> {
    capture(pattern, text).and_then(|raw| raw.parse::<u16>().ok())
}

fn directory_name(key: &str) -> String {
    Path::new(key)
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const GWT_POM: &str = r#"
<project>
  <build><plugins>
    <plugin>
      <groupId>net.ltgt.gwt.maven</groupId>
      <artifactId>gwt-maven-plugin</artifactId>
      <version>1.1.0</version>
      <configuration>
        <moduleName>com.example.App</moduleName>
        <devmodeArgs>
          <arg>-port</arg>
          <arg>8888</arg>
          <arg>-codeserverPort</arg>
          <arg>9997</arg>
        </devmodeArgs>
        <codeserverArgs>
          <arg>-bindAddress</arg>
          <arg>0.0.0.0</arg>
        </codeserverArgs>
      </configuration>
    </plugin>
  </plugins></build>
</project>
"#;

    fn detector() -> PomDetector {
        PomDetector::new(Vec::new()).unwrap()
    }

    #[test]
    fn gwt_pom_yields_module_and_ports() {
        let project = detector().parse_pom("/ws/app/pom.xml", GWT_POM).unwrap();
        assert_eq!(project.name, "com.example.App");
        assert_eq!(project.plugin_version, "1.1.0");
        assert_eq!(project.devmode_port, Some(8888));
        assert_eq!(project.codeserver_port, Some(9997));
        assert_eq!(
            project.roles,
            vec![Role::Compile, Role::Devmode, Role::Codeserver]
        );
    }

    #[test]
    fn port_args_do_not_leak_across_blocks() {
        let text = r#"
<artifactId>gwt-maven-plugin</artifactId>
<devmodeArgs><arg>-war</arg><arg>target/app</arg></devmodeArgs>
<codeserverArgs><arg>-port</arg><arg>9876</arg></codeserverArgs>
"#;
        let project = detector().parse_pom("/ws/app/pom.xml", text).unwrap();
        assert_eq!(project.devmode_port, None);
        assert_eq!(project.codeserver_port, Some(9876));
        assert_eq!(project.name, ROOT_POM_NAME);
        assert_eq!(project.plugin_version, "unknown");
    }

    #[test]
    fn jetty_only_pom_is_named_after_its_directory() {
        let text = r#"
<plugin>
  <groupId>org.eclipse.jetty.ee10</groupId>
  <artifactId>jetty-ee10-maven-plugin</artifactId>
  <version>12.0.5</version>
</plugin>
"#;
        let project = detector().parse_pom("/ws/server/pom.xml", text).unwrap();
        assert_eq!(project.name, "server");
        assert_eq!(project.plugin_version, "12.0.5");
        assert_eq!(project.roles, vec![Role::Jetty]);
    }

    #[test]
    fn unrelated_pom_is_ignored() {
        let text = "<project><artifactId>maven-compiler-plugin</artifactId></project>";
        assert!(detector().parse_pom("/ws/lib/pom.xml", text).is_none());
    }

    #[test]
    fn detect_walks_tree_and_skips_build_output() {
        let root = unique_temp_dir("detector");
        fs::create_dir_all(root.join("app")).unwrap();
        fs::create_dir_all(root.join("app/target/classes")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("app/pom.xml"), GWT_POM).unwrap();
        fs::write(root.join("app/target/classes/pom.xml"), GWT_POM).unwrap();
        fs::write(root.join("node_modules/pkg/pom.xml"), GWT_POM).unwrap();
        fs::write(root.join("pom.xml"), "<project/>").unwrap();

        let detector = PomDetector::new(vec![root.clone()]).unwrap();
        let first = detector.detect().unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].key.ends_with("app/pom.xml"));
        assert_eq!(detector.detect().unwrap(), first);
        let _ = fs::remove_dir_all(&root);
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("gwtd-{label}-{nanos}"))
    }
}
