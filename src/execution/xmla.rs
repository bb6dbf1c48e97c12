//! XMLA (SOAP over HTTPS) executor for tabular models.

use crate::config::PowerBiSettings;
use crate::error::{PipelineError, Result};
use crate::execution::engine::{QueryExecutor, QueryLanguage};
use crate::execution::powerbi::{normalize_rows, AzureAdTokenProvider};
use crate::execution::result::{QueryResult, Row};
use crate::execution::retry::{hint_for_status, retry_with_backoff, RetryPolicy};
use crate::llm::truncate;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

pub const ROWSET_NS: &str = "urn:schemas-microsoft-com:xml-analysis:rowset";
const SOAP_ACTION: &str = "urn:schemas-microsoft-com:xml-analysis:Execute";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn build_execute_envelope(statement: &str, catalog: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <Execute xmlns="urn:schemas-microsoft-com:xml-analysis">
      <Command>
        <Statement>{}</Statement>
      </Command>
      <Properties>
        <PropertyList>
          <Catalog>{}</Catalog>
          <Format>Tabular</Format>
        </PropertyList>
      </Properties>
    </Execute>
  </soap:Body>
</soap:Envelope>"#,
        escape_xml(statement),
        escape_xml(catalog)
    )
}

/// Rowset element names encode special characters as `_xHHHH_`.
fn decode_element_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find("_x") {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        let decoded = candidate
            .get(2..6)
            .filter(|_| candidate.as_bytes().get(6) == Some(&b'_'))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn typed_value(node: roxmltree::Node<'_, '_>) -> Value {
    let text = node.text().unwrap_or("");
    let xsi_type = node.attribute((XSI_NS, "type")).unwrap_or("");
    let ty = xsi_type.rsplit(':').next().unwrap_or("");
    match ty {
        "int" | "long" | "short" | "byte" | "unsignedInt" | "unsignedLong" => {
            text.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        "double" | "float" | "decimal" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        "boolean" => Value::Bool(text.eq_ignore_ascii_case("true") || text == "1"),
        _ => Value::String(text.to_string()),
    }
}

/// `faultcode: faultstring` of a SOAP fault, or the description of an XMLA error element.
pub fn parse_soap_fault(xml: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    if let Some(fault) = doc.descendants().find(|n| n.tag_name().name() == "Fault") {
        let child_text = |name: &str| {
            fault
                .descendants()
                .find(|n| n.tag_name().name() == name)
                .and_then(|n| n.text())
                .map(str::trim)
                .unwrap_or("")
                .to_string()
        };
        let code = child_text("faultcode");
        let message = child_text("faultstring");
        let detail = doc
            .descendants()
            .find(|n| n.tag_name().name() == "Error")
            .and_then(|n| n.attribute("Description"));
        return Some(match detail {
            Some(d) if message.is_empty() => format!("{}: {}", code, d),
            _ => format!("{}: {}", code, message),
        });
    }
    doc.descendants()
        .find(|n| n.tag_name().name() == "Error")
        .and_then(|n| n.attribute("Description"))
        .map(|d| d.to_string())
}

/// Rows of every `row` element in the rowset namespace.
pub fn parse_rowset(xml: &str) -> Result<Vec<Row>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| PipelineError::power_bi(format!("Invalid XMLA response: {}", e), None))?;

    let rows = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "row" && n.tag_name().namespace() == Some(ROWSET_NS))
        .map(|row| {
            row.children()
                .filter(|c| c.is_element())
                .map(|c| (decode_element_name(c.tag_name().name()), typed_value(c)))
                .collect::<Row>()
        })
        .collect();
    Ok(rows)
}

pub struct XmlaExecutor {
    client: Client,
    endpoint: String,
    catalog: String,
    tokens: AzureAdTokenProvider,
    retry: RetryPolicy,
}

impl XmlaExecutor {
    pub fn new(settings: &PowerBiSettings, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            tokens: AzureAdTokenProvider::new(client.clone(), settings, retry),
            client,
            endpoint: settings.endpoint.clone(),
            catalog: settings.dataset_name.clone(),
            retry,
        })
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.tokens = self.tokens.with_authority(authority);
        self
    }

    async fn post(&self, envelope: &str) -> Result<String> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&token)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| PipelineError::power_bi(format!("XMLA request failed: {}", e), None))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::power_bi(format!("XMLA request failed: {}", e), None))?;

        if status >= 400 {
            let detail = parse_soap_fault(&text).unwrap_or_else(|| truncate(&text, 500));
            let mut message = format!("XMLA HTTP {}: {}", status, detail);
            if let Some(hint) = hint_for_status(Some(status)) {
                message.push_str(" | Hint: ");
                message.push_str(hint);
            }
            return Err(PipelineError::power_bi(message, Some(status)));
        }
        Ok(text)
    }
}

#[async_trait]
impl QueryExecutor for XmlaExecutor {
    fn name(&self) -> &'static str {
        "xmla"
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::Dax
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        let start = Instant::now();
        let envelope = build_execute_envelope(query, &self.catalog);
        let envelope = &envelope;
        let text = retry_with_backoff(self.retry, "XMLA Execute", move || self.post(envelope)).await?;

        // Some servers answer 200 with a fault body.
        if !text.contains(ROWSET_NS) {
            if let Some(fault) = parse_soap_fault(&text) {
                return Err(PipelineError::power_bi(format!("XMLA error: {}", fault), Some(400)));
            }
        }

        let (columns, rows) = normalize_rows(parse_rowset(&text)?);
        let elapsed = start.elapsed().as_millis() as u64;
        debug!("XMLA returned {} rows in {} ms", rows.len(), elapsed);
        Ok(QueryResult::ok(self.name(), columns, rows, elapsed))
    }

    async fn health_check(&self) -> Result<bool> {
        self.tokens.token().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RESPONSE: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <ExecuteResponse xmlns="urn:schemas-microsoft-com:xml-analysis">
      <return>
        <root xmlns="urn:schemas-microsoft-com:xml-analysis:rowset"
              xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
              xmlns:xsd="http://www.w3.org/2001/XMLSchema">
          <row>
            <DIM_CUSTOMER_x005B_CUSTOMER_NAME_x005D_ xsi:type="xsd:string">Acme</DIM_CUSTOMER_x005B_CUSTOMER_NAME_x005D_>
            <_x005B_Total_x005D_ xsi:type="xsd:double">1250.5</_x005B_Total_x005D_>
          </row>
          <row>
            <DIM_CUSTOMER_x005B_CUSTOMER_NAME_x005D_ xsi:type="xsd:string">Globex</DIM_CUSTOMER_x005B_CUSTOMER_NAME_x005D_>
            <_x005B_Total_x005D_ xsi:type="xsd:long">900</_x005B_Total_x005D_>
          </row>
        </root>
      </return>
    </ExecuteResponse>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_envelope_escapes_statement() {
        let env = build_execute_envelope("EVALUATE FILTER('T', 'T'[A] < 5 && 'T'[B] = \"x\")", "Sales");
        assert!(env.contains("&lt; 5 &amp;&amp;"));
        assert!(env.contains("<Catalog>Sales</Catalog>"));
        assert!(env.contains("<Format>Tabular</Format>"));
    }

    #[test]
    fn test_decode_element_name() {
        assert_eq!(decode_element_name("T_x005B_C_x005D_"), "T[C]");
        assert_eq!(decode_element_name("plain_x_name"), "plain_x_name");
    }

    #[test]
    fn test_parse_rowset() {
        let (columns, rows) = normalize_rows(parse_rowset(RESPONSE).unwrap());
        assert_eq!(columns, vec!["CUSTOMER_NAME", "Total"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["CUSTOMER_NAME"], json!("Acme"));
        assert_eq!(rows[0]["Total"], json!(1250.5));
        assert_eq!(rows[1]["Total"], json!(900));
    }

    #[test]
    fn test_parse_soap_fault() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><soap:Fault><faultcode>XMLAnalysisError.0xc10a0004</faultcode>
  <faultstring>Query (1, 10) Cannot find table 'X'.</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        assert_eq!(
            parse_soap_fault(xml).unwrap(),
            "XMLAnalysisError.0xc10a0004: Query (1, 10) Cannot find table 'X'."
        );
        assert!(parse_soap_fault(RESPONSE).is_none());
    }
}
