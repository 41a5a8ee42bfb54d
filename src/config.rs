//! Configuration model for the relay and constructors turning parsed config
//! into live destinations.

use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use crate::association::dimse::DimseConnector;
use crate::association::scu::StoreScu;
use crate::forward::{
	DicomForwardDestination, ForwardDestination, ProgressSink, WebForwardDestination,
};
use crate::transcode::DEFAULT_JPEG_QUALITY;
use crate::types::AE;
use crate::web::DicomStowRs;
use crate::DEFAULT_AET;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
	#[serde(default = "default_aet")]
	pub calling_aet: AE,
	#[serde(default)]
	pub destinations: Vec<DestinationConfig>,
}

fn default_aet() -> AE {
	AE::from(DEFAULT_AET)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum DestinationConfig {
	#[serde(rename = "DICOM")]
	Dicom(DicomDestinationConfig),
	#[serde(rename = "WEB")]
	Web(WebDestinationConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomDestinationConfig {
	pub aet: AE,
	pub host: String,
	pub port: u16,
	/// Close the outbound association after this many milliseconds without
	/// traffic. Unset keeps it open until the peer drops it.
	#[serde(default)]
	pub idle_timeout: Option<u64>,
	#[serde(default = "default_jpeg_quality")]
	pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebDestinationConfig {
	pub url: String,
	#[serde(default)]
	pub headers: Vec<HeaderConfig>,
	#[serde(default = "default_jpeg_quality")]
	pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeaderConfig {
	pub name: String,
	pub value: String,
}

const fn default_jpeg_quality() -> u8 {
	DEFAULT_JPEG_QUALITY
}

impl DicomDestinationConfig {
	/// Builds a live DICOM destination with its own long-lived store SCU.
	pub fn build(
		&self,
		calling_aet: &str,
		progress: Arc<dyn ProgressSink>,
	) -> std::io::Result<DicomForwardDestination> {
		let address = (self.host.as_str(), self.port)
			.to_socket_addrs()?
			.next()
			.ok_or_else(|| {
				std::io::Error::new(
					std::io::ErrorKind::AddrNotAvailable,
					format!("cannot resolve {}:{}", self.host, self.port),
				)
			})?;
		let connector = DimseConnector::new(AE::from(calling_aet), self.aet.clone(), address);
		let mut scu = StoreScu::new(Box::new(connector));
		if let Some(idle_timeout) = self.idle_timeout {
			scu = scu.with_idle_timeout(Duration::from_millis(idle_timeout));
		}
		Ok(DicomForwardDestination::new(Arc::new(scu), progress)
			.with_jpeg_quality(self.jpeg_quality))
	}
}

impl WebDestinationConfig {
	pub fn build(&self, progress: Arc<dyn ProgressSink>) -> WebForwardDestination {
		let mut stow = DicomStowRs::new(self.url.clone());
		for header in &self.headers {
			stow = stow.with_header(header.name.clone(), header.value.clone());
		}
		WebForwardDestination::new(Arc::new(stow), progress).with_jpeg_quality(self.jpeg_quality)
	}
}

impl RelayConfig {
	/// Builds every configured destination, in list order.
	pub fn build_destinations(
		&self,
		progress: Arc<dyn ProgressSink>,
	) -> std::io::Result<Vec<ForwardDestination>> {
		let mut destinations = Vec::with_capacity(self.destinations.len());
		for destination in &self.destinations {
			match destination {
				DestinationConfig::Dicom(config) => destinations.push(ForwardDestination::Dicom(
					config.build(&self.calling_aet, Arc::clone(&progress))?,
				)),
				DestinationConfig::Web(config) => destinations.push(ForwardDestination::Web(
					config.build(Arc::clone(&progress)),
				)),
			}
		}
		Ok(destinations)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_mixed_destination_list() {
		let config: RelayConfig = toml::from_str(
			r#"
			calling-aet = "RELAY"

			[[destinations]]
			type = "DICOM"
			aet = "PACS"
			host = "pacs.example.org"
			port = 11112
			idle-timeout = 15000

			[[destinations]]
			type = "WEB"
			url = "https://dicomweb.example.org/studies"

			[[destinations.headers]]
			name = "Authorization"
			value = "Bearer token"
			"#,
		)
		.unwrap();

		assert_eq!(config.calling_aet, "RELAY");
		assert_eq!(config.destinations.len(), 2);
		match &config.destinations[0] {
			DestinationConfig::Dicom(dicom) => {
				assert_eq!(dicom.aet, "PACS");
				assert_eq!(dicom.port, 11112);
				assert_eq!(dicom.idle_timeout, Some(15000));
				assert_eq!(dicom.jpeg_quality, DEFAULT_JPEG_QUALITY);
			}
			DestinationConfig::Web(_) => panic!("expected a DICOM destination"),
		}
		match &config.destinations[1] {
			DestinationConfig::Web(web) => {
				assert_eq!(web.url, "https://dicomweb.example.org/studies");
				assert_eq!(web.headers.len(), 1);
			}
			DestinationConfig::Dicom(_) => panic!("expected a web destination"),
		}
	}

	#[test]
	fn calling_aet_defaults() {
		let config: RelayConfig = toml::from_str("").unwrap();
		assert_eq!(config.calling_aet, DEFAULT_AET);
		assert!(config.destinations.is_empty());
	}
}
