//! Template-based file generation for the artifact-producing phases.
//!
//! The content a real generation backend would produce is out of scope; these
//! templates stand in for it so the reconciliation path has realistic input.

use crate::engine::context::ArtifactMap;

/// Lowercase, hyphenated form of a project name, for package names and URLs.
pub fn slug(project_name: &str) -> String {
    let mut out = String::with_capacity(project_name.len());
    for ch in project_name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if (ch == ' ' || ch == '_' || ch == '-') && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

fn collection<'a>(
    map: &'a mut ArtifactMap,
    name: &str,
) -> &'a mut std::collections::BTreeMap<String, String> {
    map.entry(name.to_string()).or_default()
}

/// React + FastAPI scaffold, the phase 2 output.
pub fn scaffold_files(project_name: &str) -> ArtifactMap {
    let safe = slug(project_name);
    let mut files = ArtifactMap::new();

    let frontend = collection(&mut files, "frontend");
    frontend.insert(
        "src/App.tsx".to_string(),
        format!(
            r#"import {{ ThemeProvider, createTheme, CssBaseline }} from '@mui/material'
import Header from './components/Header'

const theme = createTheme()

function App() {{
  return (
    <ThemeProvider theme={{theme}}>
      <CssBaseline />
      <Header title="{project_name}" />
      <main>Welcome to {project_name}</main>
    </ThemeProvider>
  )
}}

export default App
"#
        ),
    );
    frontend.insert(
        "src/components/Header.tsx".to_string(),
        r#"import { AppBar, Toolbar, Typography } from '@mui/material'

export default function Header({ title }: { title: string }) {
  return (
    <AppBar position="static">
      <Toolbar>
        <Typography variant="h6">{title}</Typography>
      </Toolbar>
    </AppBar>
  )
}
"#
        .to_string(),
    );
    frontend.insert(
        "package.json".to_string(),
        format!(
            r#"{{
  "name": "{safe}-frontend",
  "version": "0.1.0",
  "private": true,
  "scripts": {{
    "dev": "vite",
    "build": "vite build",
    "type-check": "tsc --noEmit"
  }},
  "dependencies": {{
    "react": "^18.3.1",
    "react-dom": "^18.3.1",
    "@mui/material": "^6.1.7"
  }},
  "devDependencies": {{
    "typescript": "^5.7.2",
    "vite": "^5.4.11"
  }}
}}
"#
        ),
    );

    let backend = collection(&mut files, "backend");
    backend.insert(
        "main.py".to_string(),
        format!(
            r#"from fastapi import FastAPI

app = FastAPI(title="{project_name}")


@app.get("/")
async def root():
    return {{"message": "Hello from {project_name}"}}


@app.get("/health")
async def health():
    return {{"status": "ok"}}
"#
        ),
    );
    backend.insert(
        "models.py".to_string(),
        r#"from sqlalchemy import Column, Integer, String
from sqlalchemy.orm import declarative_base

Base = declarative_base()


class Item(Base):
    __tablename__ = "items"

    id = Column(Integer, primary_key=True)
    name = Column(String, nullable=False)
"#
        .to_string(),
    );
    backend.insert(
        "requirements.txt".to_string(),
        "fastapi>=0.115\nuvicorn[standard]>=0.32\nsqlalchemy>=2.0\n".to_string(),
    );

    files
}

/// Deployment scripts, the phase 3 output. Scripts only — nothing here
/// contacts a registry or a cloud provider.
pub fn deploy_files(project_name: &str) -> ArtifactMap {
    let safe = slug(project_name);
    let mut files = ArtifactMap::new();

    let deploy = collection(&mut files, "deploy");
    deploy.insert(
        "Dockerfile".to_string(),
        r#"FROM python:3.12-slim

WORKDIR /app
COPY backend/requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY backend/ .

EXPOSE 8080
CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8080"]
"#
        .to_string(),
    );
    deploy.insert(
        "deploy.sh".to_string(),
        format!(
            r#"#!/usr/bin/env bash
set -euo pipefail

# Frontend -> static hosting
pushd frontend
npm ci
npm run build
if command -v vercel >/dev/null 2>&1; then
    vercel --prod
else
    echo "vercel CLI not found; skipping frontend deploy"
fi
popd

# Backend -> container runtime
docker build -t {safe}-backend -f deploy/Dockerfile .
echo "Image {safe}-backend built. Push and roll out with your platform of choice."
"#
        ),
    );
    deploy.insert(
        "vercel.json".to_string(),
        format!(
            r#"{{
  "version": 2,
  "name": "{safe}",
  "builds": [{{ "src": "frontend/package.json", "use": "@vercel/static-build" }}]
}}
"#
        ),
    );

    files
}

/// Generated test suite, the phase 5 output.
pub fn test_files(project_name: &str) -> ArtifactMap {
    let mut files = ArtifactMap::new();

    let frontend = collection(&mut files, "frontend");
    frontend.insert(
        "vitest.config.ts".to_string(),
        r#"import { defineConfig } from 'vitest/config'

export default defineConfig({
  test: {
    environment: 'jsdom',
    setupFiles: './src/test/setup.ts',
  },
})
"#
        .to_string(),
    );
    frontend.insert(
        "src/test/App.test.tsx".to_string(),
        format!(
            r#"import {{ describe, it, expect }} from 'vitest'
import {{ render, screen }} from '@testing-library/react'
import App from '../App'

describe('App', () => {{
  it('renders the {project_name} header', () => {{
    render(<App />)
    expect(screen.getByText('{project_name}')).toBeDefined()
  }})
}})
"#
        ),
    );

    let backend = collection(&mut files, "backend");
    backend.insert(
        "tests/conftest.py".to_string(),
        r#"import pytest
from fastapi.testclient import TestClient

from main import app


@pytest.fixture
def client():
    return TestClient(app)
"#
        .to_string(),
    );
    backend.insert(
        "tests/test_health.py".to_string(),
        r#"def test_health(client):
    response = client.get("/health")
    assert response.status_code == 200
    assert response.json() == {"status": "ok"}
"#
        .to_string(),
    );

    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalizes_names() {
        assert_eq!(slug("My App"), "my-app");
        assert_eq!(slug("shop_site  v2"), "shop-site-v2");
        assert_eq!(slug("---"), "project");
        assert_eq!(slug(""), "project");
    }

    #[test]
    fn scaffold_covers_frontend_and_backend() {
        let files = scaffold_files("Demo Shop");
        assert!(files["frontend"].contains_key("src/App.tsx"));
        assert!(files["frontend"]["package.json"].contains("demo-shop-frontend"));
        assert!(files["backend"].contains_key("main.py"));
        assert!(files["backend"]["main.py"].contains("Demo Shop"));
    }

    #[test]
    fn deploy_files_are_scripts_only() {
        let files = deploy_files("Demo");
        let deploy = &files["deploy"];
        assert!(deploy.contains_key("Dockerfile"));
        assert!(deploy["deploy.sh"].starts_with("#!/usr/bin/env bash"));
        assert!(deploy["vercel.json"].contains("\"demo\""));
    }

    #[test]
    fn test_files_reference_project_name() {
        let files = test_files("Demo");
        assert!(files["frontend"]["src/test/App.test.tsx"].contains("Demo"));
        assert!(files["backend"].contains_key("tests/test_health.py"));
    }
}
