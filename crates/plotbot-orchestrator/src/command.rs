//! Plot command templates

use plotbot_core::{PlotError, ResourceShare, Result};
use std::path::Path;

/// Placeholders understood in plot command templates
pub const PLACEHOLDERS: &[&str] = &[
    "threads", "ram", "buckets", "cache", "cache2", "working", "output", "size", "progress",
];

/// Values substituted into a plot command
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    pub share: ResourceShare,
    pub cache: &'a Path,
    pub cache2: &'a Path,
    pub working: &'a Path,
    pub output: &'a Path,
    pub size: u8,
    pub progress: &'a Path,
}

impl CommandContext<'_> {
    fn value(&self, placeholder: &str) -> Option<String> {
        let path = |p: &Path| p.display().to_string();
        Some(match placeholder {
            "threads" => self.share.threads.to_string(),
            "ram" => self.share.ram.to_string(),
            "buckets" => self.share.buckets.to_string(),
            "cache" => path(self.cache),
            "cache2" => path(self.cache2),
            "working" => path(self.working),
            "output" => path(self.output),
            "size" => self.size.to_string(),
            "progress" => path(self.progress),
            _ => return None,
        })
    }
}

/// Split a template into literal text and `{name}` placeholders
fn placeholders(template: &str) -> impl Iterator<Item = (usize, usize, &str)> {
    let mut rest = 0;
    std::iter::from_fn(move || {
        let open = rest + template[rest..].find('{')?;
        let close = open + template[open..].find('}')?;
        rest = close + 1;
        Some((open, close, &template[open + 1..close]))
    })
}

/// Check a template for unknown placeholders and a missing `{output}`
pub fn validate_template(template: &str) -> Result<()> {
    if template.trim().is_empty() {
        return Err(PlotError::config("Plot command cannot be empty"));
    }

    let mut has_output = false;
    for (_, _, name) in placeholders(template) {
        if !PLACEHOLDERS.contains(&name) {
            return Err(PlotError::config(format!(
                "Plot command contains unknown placeholder {{{}}} (known: {})",
                name,
                PLACEHOLDERS.join(", ")
            )));
        }
        has_output |= name == "output";
    }

    if !has_output {
        return Err(PlotError::config(
            "Plot command must write its plot to {output}",
        ));
    }
    Ok(())
}

/// Substitute every known placeholder; unknown ones are left verbatim
pub fn render(template: &str, ctx: &CommandContext<'_>) -> String {
    let mut rendered = String::with_capacity(template.len() + 64);
    let mut last = 0;
    for (open, close, name) in placeholders(template) {
        if let Some(value) = ctx.value(name) {
            rendered.push_str(&template[last..open]);
            rendered.push_str(&value);
            last = close + 1;
        }
    }
    rendered.push_str(&template[last..]);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CommandContext<'static> {
        CommandContext {
            share: ResourceShare::new(8, 4000, 128),
            cache: Path::new("/mnt/nvme1"),
            cache2: Path::new("/mnt/nvme2"),
            working: Path::new("/var/lib/plotbot"),
            output: Path::new("/mnt/nvme1/ab12cd34"),
            size: 32,
            progress: Path::new("/var/lib/plotbot/fast_ab12cd34.progress"),
        }
    }

    #[test]
    fn test_render_default_command() {
        let template =
            "chia_plot -k {size} -r {threads} -u {buckets} -t {cache}/ -2 {cache2}/ -d {output}/";
        assert_eq!(
            render(template, &ctx()),
            "chia_plot -k 32 -r 8 -u 128 -t /mnt/nvme1/ -2 /mnt/nvme2/ -d /mnt/nvme1/ab12cd34/"
        );
    }

    #[test]
    fn test_render_keeps_unknown_braces() {
        assert_eq!(
            render("echo {nope} {ram} }{", &ctx()),
            "echo {nope} 4000 }{"
        );
    }

    #[test]
    fn test_validate() {
        assert!(validate_template("plot -d {output} -r {threads}").is_ok());
        assert!(validate_template("plot -r {threads}").is_err());
        assert!(validate_template("plot -d {output} -x {thread}").is_err());
        assert!(validate_template("   ").is_err());
    }
}
