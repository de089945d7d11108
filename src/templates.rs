//! Holding, error and dashboard page rendering (C4.7, ambient).
//!
//! The engine ships a minimal, self-contained template set rather than
//! pulling in a templating engine for three small, largely-static pages —
//! plain `format!`-interpolated strings, every interpolated value escaped.

/// Escapes the five characters that matter inside HTML text/attribute
/// context. Good enough for the opaque strings this engine ever embeds
/// (names, paths, error messages) — not a general-purpose HTML sanitizer.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Renders the holding page shown while a workload wakes up. Inline JS
/// polls `_health?container=NAME` every 1.5s and navigates to
/// `redirect_path` once the status flips to `running`; on `failed` it swaps
/// the progress bar for the recorded error and a retry button that POSTs
/// `_status/wake`.
pub fn holding_page(container: &str, redirect_path: &str) -> String {
    let container = escape_html(container);
    let redirect_path = escape_html(redirect_path);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Waking {container}&hellip;</title>
<style>
body {{ font-family: sans-serif; background: #0b0d12; color: #e8eaf0; display: flex;
       align-items: center; justify-content: center; height: 100vh; margin: 0; }}
.card {{ text-align: center; }}
.bar {{ width: 260px; height: 6px; border-radius: 3px; background: #262b38; overflow: hidden; margin: 1.5rem auto; }}
.bar > div {{ width: 40%; height: 100%; background: #5b8def; animation: slide 1.2s ease-in-out infinite; }}
@keyframes slide {{ 0% {{ margin-left: -40%; }} 100% {{ margin-left: 100%; }} }}
.error {{ color: #ff6b6b; display: none; }}
button {{ display: none; }}
</style>
</head>
<body>
<div class="card" data-container="{container}" data-redirect="{redirect_path}">
  <h1>Waking {container}&hellip;</h1>
  <div class="bar" id="bar"><div></div></div>
  <p class="error" id="error"></p>
  <button id="retry">Retry</button>
</div>
<script>
(function() {{
  var container = {container_json};
  var redirect = {redirect_json};
  function poll() {{
    fetch('_health?container=' + encodeURIComponent(container))
      .then(function(r) {{ return r.json(); }})
      .then(function(data) {{
        if (data.status === 'running') {{
          window.location.href = redirect;
        }} else if (data.status === 'failed') {{
          document.getElementById('bar').style.display = 'none';
          var err = document.getElementById('error');
          err.style.display = 'block';
          err.textContent = data.error || 'start failed';
          document.getElementById('retry').style.display = 'inline-block';
        }} else {{
          setTimeout(poll, 1500);
        }}
      }})
      .catch(function() {{ setTimeout(poll, 1500); }});
  }}
  document.getElementById('retry').addEventListener('click', function() {{
    fetch('_status/wake?container=' + encodeURIComponent(container), {{ method: 'POST' }})
      .then(function() {{
        document.getElementById('retry').style.display = 'none';
        document.getElementById('error').style.display = 'none';
        document.getElementById('bar').style.display = 'block';
        poll();
      }});
  }});
  poll();
}})();
</script>
</body>
</html>
"#,
        container = container,
        redirect_path = redirect_path,
        container_json = serde_json::to_string(&container).unwrap_or_else(|_| "\"\"".to_string()),
        redirect_json = serde_json::to_string(&redirect_path).unwrap_or_else(|_| "\"/\"".to_string()),
    )
}

/// Renders a plain error page for workload-not-found / runtime-unreachable
/// conditions.
pub fn error_page(container: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Error</title></head>
<body>
<h1>{container}</h1>
<p>{message}</p>
</body>
</html>
"#,
        container = escape_html(container),
        message = escape_html(message),
    )
}

/// Renders the dashboard shell (`_status`). The table body is populated
/// client-side by polling `_status/api` — this template is opaque content,
/// not the data contract.
pub fn dashboard_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>wakegate</title>
<style>
body { font-family: sans-serif; background: #0b0d12; color: #e8eaf0; margin: 2rem; }
table { border-collapse: collapse; width: 100%; }
th, td { text-align: left; padding: 0.5rem 1rem; border-bottom: 1px solid #262b38; }
.status-running { color: #4caf50; }
.status-starting { color: #e0a030; }
.status-failed { color: #ff6b6b; }
.status-unknown { color: #888; }
</style>
</head>
<body>
<h1>wakegate</h1>
<table id="containers">
<thead><tr><th>Name</th><th>Host</th><th>Status</th><th>Image</th><th></th></tr></thead>
<tbody></tbody>
</table>
<script>
function render(data) {
  var body = document.querySelector('#containers tbody');
  body.innerHTML = '';
  (data.containers || []).forEach(function(c) {
    var row = document.createElement('tr');
    row.innerHTML = '<td>' + c.name + '</td><td>' + (c.host || '') + '</td>' +
      '<td class="status-' + c.start_state + '">' + c.start_state + '</td>' +
      '<td>' + (c.image || '') + '</td>' +
      '<td><button data-name="' + c.name + '">wake</button></td>';
    body.appendChild(row);
  });
  body.querySelectorAll('button').forEach(function(btn) {
    btn.addEventListener('click', function() {
      fetch('_status/wake?container=' + encodeURIComponent(btn.dataset.name), { method: 'POST' })
        .then(refresh);
    });
  });
}
function refresh() {
  fetch('_status/api').then(function(r) { return r.json(); }).then(render);
}
refresh();
setInterval(refresh, 3000);
</script>
</body>
</html>
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_metacharacters() {
        assert_eq!(escape_html("<b>&'\"</b>"), "&lt;b&gt;&amp;&#39;&quot;&lt;/b&gt;");
    }

    #[test]
    fn holding_page_embeds_redirect_and_container() {
        let page = holding_page("my-app", "/dashboard");
        assert!(page.contains("my-app"));
        assert!(page.contains("/dashboard"));
    }

    #[test]
    fn holding_page_escapes_hostile_container_name() {
        let page = holding_page("<script>evil</script>", "/");
        assert!(!page.contains("<script>evil</script>"));
    }

    #[test]
    fn error_page_escapes_message() {
        let page = error_page("app", "<img onerror=alert(1)>");
        assert!(!page.contains("<img onerror"));
    }
}
