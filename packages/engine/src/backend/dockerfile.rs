// packages/engine/src/backend/dockerfile.rs
//! Image definitions for repositories that do not ship one

use crate::workload::RuntimeKind;

/// File the container backend writes next to the sources
pub const GENERATED_DOCKERFILE: &str = "Dockerfile.botyard";

const PYTHON_IMAGE: &str = "python:3.11-slim";
const NODE_IMAGE: &str = "node:20-slim";
const GO_BUILD_IMAGE: &str = "golang:1.22";
const GO_RUN_IMAGE: &str = "gcr.io/distroless/static-debian12";

/// Render a Dockerfile for `runtime` starting `entry_point`.
///
/// Returns `None` for container-native repositories, which bring their own.
pub fn synthesize(runtime: RuntimeKind, entry_point: &str) -> Option<String> {
    let text = match runtime {
        RuntimeKind::Python => format!(
            "FROM {image}\n\
             WORKDIR /app\n\
             ENV PYTHONUNBUFFERED=1\n\
             COPY . .\n\
             RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\n\
             CMD {cmd}\n",
            image = PYTHON_IMAGE,
            cmd = exec_form(&["python", "-u", entry_point]),
        ),
        RuntimeKind::Node => format!(
            "FROM {image}\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN if [ -f package.json ]; then npm install --omit=dev; fi\n\
             CMD {cmd}\n",
            image = NODE_IMAGE,
            cmd = exec_form(&["node", entry_point]),
        ),
        RuntimeKind::Go => format!(
            "FROM {build} AS build\n\
             WORKDIR /src\n\
             COPY . .\n\
             RUN CGO_ENABLED=0 go build -o /out/bot {entry}\n\
             FROM {run}\n\
             COPY --from=build /out/bot /bot\n\
             CMD [\"/bot\"]\n",
            build = GO_BUILD_IMAGE,
            run = GO_RUN_IMAGE,
            entry = shell_word(entry_point),
        ),
        RuntimeKind::Container => return None,
    };
    Some(text)
}

/// JSON array form, so entry points with spaces or quotes stay one argument
fn exec_form(argv: &[&str]) -> String {
    serde_json::to_string(argv).unwrap_or_else(|_| "[]".to_string())
}

fn shell_word(word: &str) -> String {
    if word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "./_-".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
