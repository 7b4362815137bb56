//! Decoy responder
//!
//! Requests that fail upgrade validation get a small realistic page with an
//! nginx header set, identical for probes and stray crawlers. Nothing in the
//! response distinguishes this server from a stock nginx install.

use crate::transport::BoxedIo;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

const NGINX_HTML: &str = "<!DOCTYPE html>\n\
<html>\n\
<head>\n\
<title>Welcome to nginx!</title>\n\
<style>\n\
html { color-scheme: light dark; }\n\
body { width: 35em; margin: 0 auto;\n\
font-family: Tahoma, Verdana, Arial, sans-serif; }\n\
</style>\n\
</head>\n\
<body>\n\
<h1>Welcome to nginx!</h1>\n\
<p>If you see this page, the nginx web server is successfully installed and\n\
working. Further configuration is required.</p>\n\
\n\
<p>For online documentation and support please refer to\n\
<a href=\"http://nginx.org/\">nginx.org</a>.<br/>\n\
Commercial support is available at\n\
<a href=\"http://nginx.com/\">nginx.com</a>.</p>\n\
\n\
<p><em>Thank you for using nginx.</em></p>\n\
</body>\n\
</html>\n";

/// Answer a failed-validation request with a plausible page.
pub async fn respond(io: &mut BoxedIo, path: &str) -> std::io::Result<()> {
    let (status, content_type, body) = select_response(path);

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    let head = format!(
        "HTTP/1.1 {}\r\n\
         Server: nginx/1.18.0\r\n\
         Date: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        status,
        date,
        content_type,
        body.len(),
    );

    io.write_all(head.as_bytes()).await?;
    io.write_all(body.as_bytes()).await?;
    io.flush().await
}

fn select_response(path: &str) -> (&'static str, &'static str, String) {
    if path == "/" || path == "/index.html" {
        return ("200 OK", "text/html", NGINX_HTML.to_string());
    }
    if path.contains("api") || path.contains("json") {
        let body = format!(
            "{{\"status\":\"error\",\"code\":404,\"ts\":{}}}",
            Utc::now().timestamp()
        );
        return ("404 Not Found", "application/json", body);
    }
    ("404 Not Found", "text/html", NGINX_HTML.to_string())
}
