//! netrc credentials
//!
//! Just enough of the netrc format for `machine`, `default`, `login` and
//! `password` tokens. `macdef` blocks and `account` values are skipped.

/// Login and password found for a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Default)]
struct Entry {
    login: Option<String>,
    password: Option<String>,
}

impl Entry {
    fn into_credentials(self) -> Option<Credentials> {
        Some(Credentials {
            login: self.login?,
            password: self.password.unwrap_or_default(),
        })
    }
}

/// Credentials for `host` in netrc `contents`
///
/// A `machine` entry matching the host wins over `default`. Any `:port`
/// suffix on `host` is ignored.
pub fn credentials_for(contents: &str, host: &str) -> Option<Credentials> {
    let host = host.split(':').next().unwrap_or(host);
    let mut tokens = contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace);

    let mut matched: Option<Entry> = None;
    let mut default: Option<Entry> = None;
    // Which entry the current login/password tokens belong to
    let mut current: Option<bool> = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                let name = tokens.next().unwrap_or("");
                current = if name == host && matched.is_none() {
                    matched = Some(Entry::default());
                    Some(true)
                } else {
                    None
                };
            }
            "default" => {
                current = if default.is_none() {
                    default = Some(Entry::default());
                    Some(false)
                } else {
                    None
                };
            }
            "login" | "password" | "account" => {
                let value = tokens.next().map(str::to_string);
                let entry = match current {
                    Some(true) => matched.as_mut(),
                    Some(false) => default.as_mut(),
                    None => None,
                };
                if let Some(entry) = entry {
                    match token {
                        "login" => entry.login = value,
                        "password" => entry.password = value,
                        _ => {}
                    }
                }
            }
            "macdef" => {
                // Runs to the next blank line, which the tokenizer cannot see
                tokens.next();
                current = None;
            }
            _ => {}
        }
    }

    matched
        .and_then(Entry::into_credentials)
        .or_else(|| default.and_then(Entry::into_credentials))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETRC: &str = "\
# seedboxes
machine other.example login bob password hunter2
machine box.example
    login alice
    password s3cret
default login anonymous password guest
";

    #[test]
    fn test_machine_entry() {
        let creds = credentials_for(NETRC, "box.example").unwrap();
        assert_eq!(creds.login, "alice");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn test_port_is_ignored() {
        let creds = credentials_for(NETRC, "other.example:443").unwrap();
        assert_eq!(creds.login, "bob");
    }

    #[test]
    fn test_default_entry() {
        let creds = credentials_for(NETRC, "unknown.example").unwrap();
        assert_eq!(creds.login, "anonymous");
        assert_eq!(creds.password, "guest");
    }

    #[test]
    fn test_no_match() {
        assert!(credentials_for("machine a login b password c", "z").is_none());
        assert!(credentials_for("", "z").is_none());
    }

    #[test]
    fn test_missing_login() {
        assert!(credentials_for("machine box.example password x", "box.example").is_none());
    }
}
