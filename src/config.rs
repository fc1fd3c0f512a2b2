//! Daemon configuration: filter definitions and filter chains.

use crate::Error;
use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
};

/// One named unit of filtering.
///
/// A concrete filter names an external program plus its arguments; a
/// chain names an ordered list of other filter definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    /// Unique name of the filter or chain.
    pub name: String,
    /// Set if this entry is a chain of other filters.
    pub chain: bool,
    /// Executable path plus arguments, or the referenced filter names.
    pub args: Vec<String>,
}

/// The full filtering policy.
///
/// Insertion order is significant: it is the order filter processes are
/// forked in and the order entries are announced to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub filters: Vec<FilterSpec>,
}

impl Config {
    /// Look up a filter definition by name.
    pub fn lookup(&self, name: &str) -> Option<&FilterSpec> {
        self.filters.iter().find(|f| f.name == name)
    }

    /// Resolve a name to its ordered list of concrete filters.
    ///
    /// Chains are expanded depth-first, left to right; only concrete
    /// filters appear in the result.  Unknown references and chain
    /// loops are configuration errors.
    pub fn resolve_chain(&self, name: &str) -> Result<Vec<String>, Error> {
        let spec = self
            .lookup(name)
            .ok_or_else(|| Error::ConfigError(format!("undefined filter {}", name)))?;

        let mut visited = HashSet::new();
        let mut leaves = Vec::new();
        self.resolve_spec(spec, &mut visited, &mut leaves)?;

        Ok(leaves)
    }

    fn resolve_spec<'a>(
        &'a self,
        spec: &'a FilterSpec,
        visited: &mut HashSet<&'a str>,
        leaves: &mut Vec<String>,
    ) -> Result<(), Error> {
        if !spec.chain {
            leaves.push(spec.name.clone());
            return Ok(());
        }

        // The visited set tracks the current expansion path only, so a
        // filter may legally be reached through several chains.
        if !visited.insert(&spec.name) {
            return Err(Error::ConfigError(format!(
                "chain {} references itself",
                spec.name
            )));
        }

        for target in &spec.args {
            let next = self.lookup(target).ok_or_else(|| {
                Error::ConfigError(format!(
                    "chain {} references undefined filter {}",
                    spec.name, target
                ))
            })?;
            self.resolve_spec(next, visited, leaves)?;
        }

        visited.remove(spec.name.as_str());

        Ok(())
    }

    /// Check the configuration-graph invariants.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for spec in &self.filters {
            if spec.name.is_empty() {
                return Err(Error::ConfigError("empty filter name".to_string()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "duplicate filter {}",
                    spec.name
                )));
            }
        }

        for spec in self.filters.iter().filter(|f| f.chain) {
            if self.resolve_chain(&spec.name)?.is_empty() {
                return Err(Error::ConfigError(format!(
                    "chain {} expands to no filters",
                    spec.name
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in &self.filters {
            write!(
                f,
                "{} {}",
                if spec.chain { "chain" } else { "filter" },
                spec.name
            )?;
            for arg in &spec.args {
                write!(f, " {}", arg)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Parse the configuration file.
pub fn parse_file(path: &str, macros: &[(String, String)]) -> Result<Config, Error> {
    let input = fs::read_to_string(path)
        .map_err(|err| Error::ConfigError(format!("{}: {}", path, err)))?;
    parse_str(path, &input, macros)
}

/// Parse a configuration from a string.
///
/// The grammar is line-based: `filter <name> <program> [argument ...]`,
/// `chain <name> <filter> [filter ...]`, macro definitions of the form
/// `ident = value`, `$ident` expansion inside words, and `#` comments.
/// Macros given on the command line override file definitions.
pub fn parse_str(
    file: &str,
    input: &str,
    macros: &[(String, String)],
) -> Result<Config, Error> {
    let cmdline: HashSet<&str> = macros.iter().map(|(name, _)| name.as_str()).collect();
    let mut defines: HashMap<String, String> = macros.iter().cloned().collect();
    let mut filters = Vec::new();

    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        let text = raw.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        if let Some((name, value)) = macro_definition(text) {
            if !cmdline.contains(name) {
                defines.insert(name.to_string(), value.to_string());
            }
            continue;
        }

        let mut words = Vec::new();
        for word in text.split_whitespace() {
            let word = match word.strip_prefix('$') {
                Some(name) => defines.get(name).cloned().ok_or_else(|| {
                    parse_error(file, line, format!("macro {} not defined", name))
                })?,
                None => word.to_string(),
            };
            words.push(word);
        }

        match words[0].as_str() {
            "filter" if words.len() >= 3 => filters.push(FilterSpec {
                name: words[1].clone(),
                chain: false,
                args: words[2..].to_vec(),
            }),
            "chain" if words.len() >= 3 => filters.push(FilterSpec {
                name: words[1].clone(),
                chain: true,
                args: words[2..].to_vec(),
            }),
            "filter" | "chain" => {
                return Err(parse_error(file, line, "missing arguments".to_string()));
            }
            directive => {
                return Err(parse_error(
                    file,
                    line,
                    format!("unknown directive {}", directive),
                ));
            }
        }
    }

    let conf = Config { filters };
    conf.validate()?;

    Ok(conf)
}

fn parse_error(file: &str, line: usize, message: String) -> Error {
    Error::ParseError {
        file: file.to_string(),
        line,
        message,
    }
}

/// Recognize a `ident = value` macro definition.
fn macro_definition(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty()
        || name == "filter"
        || name == "chain"
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((name, value.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Config, Error> {
        parse_str("test.conf", input, &[])
    }

    #[test]
    fn parse_filters_and_chains() {
        let conf = parse(
            "# mail filters\n\
             filter reject-empty /usr/libexec/fbad\n\
             filter greylist /usr/libexec/fgrey -d /var/db/grey\n\
             chain all reject-empty greylist\n",
        )
        .unwrap();

        assert_eq!(conf.filters.len(), 3);
        assert_eq!(conf.filters[0].name, "reject-empty");
        assert!(!conf.filters[0].chain);
        assert_eq!(conf.filters[1].args[1], "-d");
        assert!(conf.filters[2].chain);
        assert_eq!(conf.filters[2].args, vec!["reject-empty", "greylist"]);
    }

    #[test]
    fn display_matches_input_format() {
        let input = "filter a /bin/a\nchain all a\n";
        let conf = parse(input).unwrap();
        assert_eq!(conf.to_string(), input);
    }

    #[test]
    fn macros_expand() {
        let conf = parse(
            "libexec = \"/usr/libexec\"\n\
             filter grey $libexec -v\n",
        )
        .unwrap();
        assert_eq!(conf.filters[0].args[0], "/usr/libexec");
    }

    #[test]
    fn cmdline_macros_override_file_definitions() {
        let macros = vec![("libexec".to_string(), "/opt/libexec".to_string())];
        let conf = parse_str(
            "test.conf",
            "libexec = /usr/libexec\nfilter grey $libexec\n",
            &macros,
        )
        .unwrap();
        assert_eq!(conf.filters[0].args[0], "/opt/libexec");
    }

    #[test]
    fn undefined_macro_is_an_error() {
        let err = parse("filter grey $nope\n").unwrap_err();
        assert!(err.to_string().contains("macro nope not defined"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = parse(
            "filter x /bin/x\n\
             filter x /bin/y\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate filter x"));
    }

    #[test]
    fn unresolved_chain_reference_is_rejected() {
        let err = parse("chain all nosuch\n").unwrap_err();
        assert!(err.to_string().contains("undefined filter nosuch"));
    }

    #[test]
    fn chain_cycles_are_rejected() {
        let err = parse(
            "chain a b\n\
             chain b a\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("references itself"));
    }

    #[test]
    fn chain_resolution_is_depth_first() {
        let conf = parse(
            "filter b /bin/b\n\
             filter d /bin/d\n\
             filter e /bin/e\n\
             chain c d e\n\
             chain a b c\n",
        )
        .unwrap();

        assert_eq!(conf.resolve_chain("a").unwrap(), vec!["b", "d", "e"]);
    }

    #[test]
    fn chain_resolution_is_idempotent() {
        let conf = parse(
            "filter b /bin/b\n\
             filter d /bin/d\n\
             chain c d b\n\
             chain a b c\n",
        )
        .unwrap();

        let first = conf.resolve_chain("a").unwrap();
        let second = conf.resolve_chain("a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shared_filters_may_appear_in_several_chains() {
        let conf = parse(
            "filter x /bin/x\n\
             chain c1 x\n\
             chain c2 x c1\n",
        )
        .unwrap();

        assert_eq!(conf.resolve_chain("c2").unwrap(), vec!["x", "x"]);
    }

    #[test]
    fn unknown_directive_names_the_line() {
        let err = parse("filter a /bin/a\nlisten on all\n").unwrap_err();
        assert_eq!(err.to_string(), "test.conf:2: unknown directive listen");
    }
}
