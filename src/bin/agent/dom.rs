use browser_agent::types::{InteractiveElement, Observation};
use headless_chrome::Tab;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{EXTRACT_MAX_CHARS, MAX_ELEMENTS_PER_OBSERVATION};

/// Installs a fetch/XHR in-flight counter on the page if it is missing.
/// A page that is still loading counts as one pending request.
const PENDING_JS: &str = r#"
(() => {
  if (!window.__agentNet) {
    const net = { pending: 0 };
    window.__agentNet = net;
    const origFetch = window.fetch;
    if (origFetch) {
      window.fetch = function(...args) {
        net.pending++;
        return origFetch.apply(this, args).finally(() => { net.pending = Math.max(0, net.pending - 1); });
      };
    }
    const origSend = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function(...args) {
      net.pending++;
      this.addEventListener('loadend', () => { net.pending = Math.max(0, net.pending - 1); }, { once: true });
      return origSend.apply(this, args);
    };
  }
  return window.__agentNet.pending + (document.readyState === 'complete' ? 0 : 1);
})()
"#;

/// Enumerates visible interactive elements and tags each with
/// `data-agent-index`. An element keeps its index for as long as it stays in
/// the document, so element sets can be compared between snapshots; new
/// elements get fresh indices. Read-only apart from the index attribute.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META']);
  const INTERACTIVE = new Set(['a','button','input','textarea','select','summary','details']);
  const ROLES = new Set(['button','link','checkbox','radio','tab','menuitem','option','combobox','switch','textbox']);
  const ATTRS = ['type','name','placeholder','aria-label','role','href','value','title'];
  if (window.__agentNextIndex === undefined) window.__agentNextIndex = 1;
  const elements = [];

  function isVisible(el) {
    if (el.offsetParent === null && getComputedStyle(el).position !== 'fixed') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function isInteractive(el, tag) {
    if (INTERACTIVE.has(tag)) return !el.disabled;
    const role = el.getAttribute('role');
    if (role && ROLES.has(role)) return true;
    return el.hasAttribute('onclick') || el.getAttribute('contenteditable') === 'true';
  }

  function walk(node, depth) {
    if (depth > 25 || elements.length >= __LIMIT__) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      if (isInteractive(child, tag)) {
        let index = parseInt(child.getAttribute('data-agent-index') || '', 10);
        if (isNaN(index)) {
          index = window.__agentNextIndex++;
          child.setAttribute('data-agent-index', String(index));
        }
        const attributes = {};
        for (const name of ATTRS) {
          const v = child.getAttribute(name);
          if (v) attributes[name] = v.slice(0, 80);
        }
        if (tag === 'select') {
          attributes.options = [...child.options].map(o => o.text.trim().slice(0, 20)).join('|');
        }
        const text = (child.innerText || child.value || '').trim().replace(/\s+/g, ' ').slice(0, 120);
        elements.push({ index, tag, text, attributes });
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify({ url: location.href, title: document.title, elements });
})()
"#;

const EXTRACT_JS: &str = r#"(document.body ? document.body.innerText : '')"#;

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    url: String,
    title: String,
    elements: Vec<InteractiveElement>,
}

fn eval_string(tab: &Arc<Tab>, js: &str) -> anyhow::Result<String> {
    let result = tab.evaluate(js, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Fresh page snapshot. Tabs are filled in by the caller.
pub fn capture_observation(tab: &Arc<Tab>) -> anyhow::Result<Observation> {
    let js = SNAPSHOT_JS.replace("__LIMIT__", &MAX_ELEMENTS_PER_OBSERVATION.to_string());
    let raw: RawSnapshot = serde_json::from_str(&eval_string(tab, &js)?)?;
    let elements: BTreeMap<u32, InteractiveElement> = raw
        .elements
        .into_iter()
        .map(|element| (element.index, element))
        .collect();

    Ok(Observation {
        url: raw.url,
        title: raw.title,
        elements,
        tabs: Vec::new(),
        pending_requests: pending_requests(tab).unwrap_or(0),
    })
}

pub fn pending_requests(tab: &Arc<Tab>) -> anyhow::Result<usize> {
    let result = tab.evaluate(PENDING_JS, false)?;
    Ok(result.value.and_then(|v| v.as_u64()).unwrap_or(0) as usize)
}

/// CSS selector of an element tagged by the snapshot script.
pub fn selector_for(index: u32) -> String {
    format!("[data-agent-index=\"{}\"]", index)
}

pub fn extract_text(tab: &Arc<Tab>) -> anyhow::Result<String> {
    let text = eval_string(tab, EXTRACT_JS)?;
    Ok(text.chars().take(EXTRACT_MAX_CHARS).collect())
}

pub fn clear_input(tab: &Arc<Tab>, index: u32) -> anyhow::Result<()> {
    tab.evaluate(
        &format!(
            "(() => {{ const el = document.querySelector('{}'); if (el) el.value = ''; }})()",
            selector_for(index).replace('\'', "\\'")
        ),
        false,
    )?;
    Ok(())
}

/// Select an option by visible text. Returns false when no option matched.
pub fn select_option(tab: &Arc<Tab>, index: u32, text: &str) -> anyhow::Result<bool> {
    let js = format!(
        r#"(() => {{
  const el = document.querySelector('{sel}');
  if (!el || !el.options) return false;
  const wanted = {text}.trim().toLowerCase();
  const opt = [...el.options].find(o => o.text.trim().toLowerCase() === wanted);
  if (!opt) return false;
  el.value = opt.value;
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return true;
}})()"#,
        sel = selector_for(index).replace('\'', "\\'"),
        text = serde_json::json!(text),
    );
    let result = tab.evaluate(&js, false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

pub fn scroll(tab: &Arc<Tab>, down: bool, pages: f32, index: Option<u32>) -> anyhow::Result<()> {
    let direction = if down { 1.0 } else { -1.0 };
    let js = match index {
        Some(index) => format!(
            "(() => {{ const el = document.querySelector('{}'); if (el) el.scrollBy(0, {} * el.clientHeight); }})()",
            selector_for(index).replace('\'', "\\'"),
            direction * pages
        ),
        None => format!("window.scrollBy(0, {} * window.innerHeight)", direction * pages),
    };
    tab.evaluate(&js, false)?;
    Ok(())
}

pub fn go_back(tab: &Arc<Tab>) -> anyhow::Result<()> {
    tab.evaluate("history.back()", false)?;
    Ok(())
}
