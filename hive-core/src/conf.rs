//! Ini-style configuration files
//!
//! The platform keeps its operational configuration in plain ini files
//! (`etc/hive.conf`, `etc/scout/scout.conf`, `etc/scout/outpost.list`).
//! Section names may contain spaces (`[outpost vault]`, `[agent scout]`).
//! Files are rewritten deterministically in declaration order so that
//! repeated load/save cycles are stable.

use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniFile {
    sections: Vec<IniSection>,
}

impl IniFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse ini text. Comments (`#`, `;`) and blank lines are skipped;
    /// keys outside any section are ignored.
    pub fn parse(text: &str) -> Self {
        let mut file = Self::new();
        let mut current: Option<IniSection> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(done) = current.take() {
                    file.sections.push(done);
                }
                current = Some(IniSection::new(name.trim()));
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                if let Some(section) = current.as_mut() {
                    section.set(key.trim(), value.trim());
                }
            }
        }

        if let Some(done) = current.take() {
            file.sections.push(done);
        }

        file
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.entries {
                out.push_str(&format!("{key} = {value}\n"));
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .with_context(|| format!("cannot write config file {}", path.display()))
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut IniSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    /// Section accessor that creates the section when missing.
    pub fn section_or_insert(&mut self, name: &str) -> &mut IniSection {
        if self.section(name).is_none() {
            self.sections.push(IniSection::new(name));
        }
        self.section_mut(name).expect("section was just inserted")
    }

    pub fn remove_section(&mut self, name: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.name != name);
        before != self.sections.len()
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter()
    }

    /// Names of sections starting with the given prefix, with the prefix
    /// stripped (`section_names("outpost ")` yields the outpost ids).
    pub fn section_names(&self, prefix: &str) -> Vec<String> {
        self.sections
            .iter()
            .filter_map(|s| s.name.strip_prefix(prefix))
            .map(|n| n.to_string())
            .collect()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.section_or_insert(section).set(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPOST_LIST: &str = "\
# known outposts
[outpost vault]
host = vault.example.org
username = hive
directory = /opt/hive
remote_port = 30000
local_tunnel = 30100
remote_tunnel = 30200
mips = 2000
priority = 1
";

    #[test]
    fn parses_sections_with_spaces() {
        let ini = IniFile::parse(OUTPOST_LIST);
        let section = ini.section("outpost vault").unwrap();

        assert_eq!(section.get("host"), Some("vault.example.org"));
        assert_eq!(section.get_u16("remote_port"), Some(30000));
        assert_eq!(section.get_f64("mips"), Some(2000.0));
        assert_eq!(section.get_i64("priority"), Some(1));
        assert_eq!(ini.section_names("outpost "), vec!["vault"]);
    }

    #[test]
    fn render_is_stable_under_reparse() {
        let ini = IniFile::parse(OUTPOST_LIST);
        let rendered = ini.render();
        assert_eq!(IniFile::parse(&rendered), ini);
        assert_eq!(IniFile::parse(&rendered).render(), rendered);
    }

    #[test]
    fn set_creates_sections_and_updates_keys() {
        let mut ini = IniFile::new();
        ini.set("agents", "free", "a1 a2");
        ini.set("agents", "free", "a1");
        ini.set("agents", "hold", "a2");

        assert_eq!(ini.get("agents", "free"), Some("a1"));
        assert_eq!(ini.get("agents", "hold"), Some("a2"));
    }

    #[test]
    fn remove_section_reports_presence() {
        let mut ini = IniFile::parse(OUTPOST_LIST);
        assert!(ini.remove_section("outpost vault"));
        assert!(!ini.remove_section("outpost vault"));
        assert!(ini.section("outpost vault").is_none());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(IniFile::load(Path::new("/nonexistent/hive.conf")).is_err());
    }
}
