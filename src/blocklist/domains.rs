//! Domain list file parser.
//!
//! Parses files with one domain per line, as accepted by `domains set --file`.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Parser for simple domain list format.
///
/// # Format
///
/// - One domain per line
/// - Comments start with `#`
/// - Empty lines are ignored
/// - Whitespace is trimmed
/// - A leading `*.` and a trailing `.` are dropped, since parent matching
///   already covers every subdomain
/// - Entries are lowercased
///
/// ```text
/// # Social
/// example.com
/// *.ads.example.org
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainListParser;

impl DomainListParser {
    pub fn parse(&self, reader: &mut dyn BufRead) -> io::Result<Vec<String>> {
        let mut domains = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let domain = trimmed.strip_prefix("*.").unwrap_or(trimmed);
            let domain = domain.trim_end_matches('.');
            if domain.is_empty() {
                continue;
            }
            domains.push(domain.to_lowercase());
        }

        Ok(domains)
    }

    pub fn parse_file(&self, path: impl AsRef<Path>) -> io::Result<Vec<String>> {
        let file = File::open(path)?;
        self.parse(&mut BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Vec<String> {
        DomainListParser
            .parse(&mut BufReader::new(content.as_bytes()))
            .unwrap()
    }

    #[test]
    fn test_simple_domains() {
        let domains = parse("example.com\ntest.org\nanother.net");
        assert_eq!(domains, vec!["example.com", "test.org", "another.net"]);
    }

    #[test]
    fn test_comments_and_empty_lines() {
        let content = "# Comment line\nexample.com\n\n  # indented\n\ntest.org\n";
        assert_eq!(parse(content), vec!["example.com", "test.org"]);
    }

    #[test]
    fn test_normalizes_entries() {
        let content = "  Example.COM  \n*.Ads.Tracker.net\nfqdn.org.\n*.\n";
        assert_eq!(
            parse(content),
            vec!["example.com", "ads.tracker.net", "fqdn.org"]
        );
    }

    #[test]
    fn test_windows_line_endings() {
        assert_eq!(parse("example.com\r\ntest.org\r\n"), vec!["example.com", "test.org"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse("").is_empty());
        assert!(parse("# only\n# comments").is_empty());
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "# focus\nvideo.example\n").unwrap();

        assert_eq!(DomainListParser.parse_file(&path).unwrap(), vec!["video.example"]);
    }

    #[test]
    fn test_parse_missing_file_fails() {
        assert!(DomainListParser.parse_file("/nonexistent/list.txt").is_err());
    }
}
