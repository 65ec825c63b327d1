//! External client command lines with `{placeholder}` substitution.

use sshsock_traits::ssh::TemplateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    LocalPort,
    RemoteHost,
    RemotePort,
    RemoteSocketPath,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "local_port" => Some(Self::LocalPort),
            "remote_host" => Some(Self::RemoteHost),
            "remote_port" => Some(Self::RemotePort),
            "remote_socket_path" => Some(Self::RemoteSocketPath),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(Placeholder),
}

/// Values substituted into a [`CommandTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub local_port: u16,
    pub remote_host: &'a str,
    pub remote_port: u16,
    pub remote_socket_path: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' => {
                    let rest = &source[pos + 1..];
                    let end = rest.find('}').ok_or(TemplateError::Unterminated(pos))?;
                    let name = &rest[..end];
                    let placeholder = Placeholder::from_name(name)
                        .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Value(placeholder));
                    // Skip the name and the closing brace.
                    for _ in 0..name.chars().count() + 1 {
                        chars.next();
                    }
                }
                '}' => return Err(TemplateError::Unbalanced(pos)),
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> String {
        let mut out = String::with_capacity(self.source.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(Placeholder::LocalPort) => out.push_str(&vars.local_port.to_string()),
                Segment::Value(Placeholder::RemoteHost) => out.push_str(vars.remote_host),
                Segment::Value(Placeholder::RemotePort) => out.push_str(&vars.remote_port.to_string()),
                Segment::Value(Placeholder::RemoteSocketPath) => out.push_str(vars.remote_socket_path),
            }
        }
        out
    }

    /// Renders and splits into words using shell quoting rules, then appends
    /// `extra_args` verbatim.
    pub fn argv(&self, vars: &TemplateVars<'_>, extra_args: &[String]) -> Result<Vec<String>, TemplateError> {
        let rendered = self.render(vars);
        let mut words = shlex::split(&rendered).ok_or_else(|| TemplateError::Tokenize(rendered.clone()))?;
        if words.is_empty() {
            return Err(TemplateError::Empty);
        }
        words.extend(extra_args.iter().cloned());
        Ok(words)
    }
}
