//! 路由规则：按声明顺序匹配存储路径并渲染公开 URL。

use regex_lite::{Captures, Regex};

use crate::auth::Credentials;
use crate::template::{Template, TemplateError};

#[derive(Debug)]
pub struct RouteRule {
    pattern: Regex,
    template: Template,
}

impl RouteRule {
    pub fn new(pattern: Regex, template: Template) -> Self {
        Self { pattern, template }
    }
}

/// 有序规则表，首个匹配的模式生效。
#[derive(Debug, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 为 `path` 渲染 URL，无匹配时返回空字符串。
    pub fn render(&self, path: &str, credentials: &Credentials) -> Result<String, TemplateError> {
        for rule in &self.rules {
            if let Some(captures) = rule.pattern.captures(path) {
                return rule
                    .template
                    .render(|name| resolve_field(name, &captures, credentials));
            }
        }
        Ok(String::new())
    }
}

fn resolve_field(
    name: &str,
    captures: &Captures<'_>,
    credentials: &Credentials,
) -> Result<String, TemplateError> {
    match name {
        "user" => Ok(credentials.username.clone()),
        "password" => Ok(credentials.password.clone()),
        _ => {
            let index = name
                .parse::<usize>()
                .map_err(|_| TemplateError::UnknownField(name.to_string()))?;
            Ok(captures
                .get(index)
                .map(|group| group.as_str().to_string())
                .unwrap_or_default())
        }
    }
}
