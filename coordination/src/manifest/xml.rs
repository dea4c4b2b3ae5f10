//! XML manifest loading (spec §3, §4.1).
//!
//! The wire format mirrors Disnix's own manifest.xml: a `<services>` table,
//! an `<infrastructure>` table of targets, a `<distribution>` of service
//! mappings and an optional `<snapshots>` table of stateful mappings.
//! Parsed with a streaming `quick_xml::Reader` rather than full `serde`
//! derive, since attribute order must be preserved into `OrderedMap`
//! (serde's map visitor does not guarantee that).

use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use super::ordered::OrderedMap;
use super::types::{DependencyRef, Manifest, Service, ServiceMapping, SnapshotMapping, Target};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest input at byte {offset}: {reason}")]
    MalformedInput { offset: usize, reason: String },

    #[error("mapping ({service}, {container}, {target}) references undefined {what} {name:?}")]
    MissingReference {
        service: String,
        container: String,
        target: String,
        what: &'static str,
        name: String,
    },

    #[error("dependency cycle detected among services: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("duplicate mapping ({service}, {container}, {target})")]
    DuplicateMapping {
        service: String,
        container: String,
        target: String,
    },
}

impl Manifest {
    pub fn load_xml<R: BufRead>(reader: R) -> Result<Manifest, ManifestError> {
        let mut xml = Reader::from_reader(reader);
        xml.trim_text(true);

        let mut manifest = Manifest::new();
        let mut buf = Vec::new();
        let mut path: Vec<String> = Vec::new();

        // per-element scratch state
        let mut cur_service: Option<ServiceBuilder> = None;
        let mut cur_dep: Option<DependencyRef> = None;
        let mut cur_target: Option<TargetBuilder> = None;
        let mut cur_container_name: Option<String> = None;
        let mut cur_mapping: Option<MappingBuilder> = None;
        let mut cur_snapshot: Option<SnapshotBuilder> = None;
        let mut text = String::new();

        loop {
            match xml.read_event_into(&mut buf).map_err(|e| ManifestError::MalformedInput {
                offset: xml.buffer_position(),
                reason: e.to_string(),
            })? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    match name.as_str() {
                        "service" => cur_service = Some(ServiceBuilder::default()),
                        "dependency" => cur_dep = Some(DependencyRef { service: String::new(), container: String::new(), target: None }),
                        "target" => {
                            let mut name_attr = String::new();
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"name" {
                                    name_attr = String::from_utf8_lossy(&attr.value).into_owned();
                                }
                            }
                            cur_target = Some(TargetBuilder::new(name_attr));
                        }
                        "container" => {
                            let mut name_attr = String::new();
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"name" {
                                    name_attr = String::from_utf8_lossy(&attr.value).into_owned();
                                }
                            }
                            cur_container_name = Some(name_attr);
                        }
                        "property" => {
                            // attribute "name" stashed via text accumulation below
                            if let Some(t) = cur_target.as_mut() {
                                for attr in e.attributes().flatten() {
                                    if attr.key.as_ref() == b"name" {
                                        t.pending_property = Some(String::from_utf8_lossy(&attr.value).into_owned());
                                    }
                                }
                            }
                        }
                        "mapping" if path.last().map(String::as_str) == Some("distribution") => {
                            cur_mapping = Some(MappingBuilder::default());
                        }
                        "mapping" if path.last().map(String::as_str) == Some("snapshots") => {
                            cur_snapshot = Some(SnapshotBuilder::default());
                        }
                        _ => {}
                    }
                    path.push(name);
                    text.clear();
                }
                Event::Text(e) => {
                    text.push_str(&e.unescape().map_err(|err| ManifestError::MalformedInput {
                        offset: xml.buffer_position(),
                        reason: err.to_string(),
                    })?);
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let value = std::mem::take(&mut text);
                    match name.as_str() {
                        "name" => {
                            if let Some(s) = cur_service.as_mut() {
                                s.name = value.clone();
                            }
                        }
                        "pkg" => {
                            if let Some(s) = cur_service.as_mut() {
                                s.package = value.clone();
                            }
                        }
                        "type" => {
                            if let Some(s) = cur_service.as_mut() {
                                s.service_type = value.clone();
                            }
                        }
                        "service" if cur_dep.is_some() => {
                            if let Some(d) = cur_dep.as_mut() {
                                d.service = value.clone();
                            }
                        }
                        "container" if cur_dep.is_some() => {
                            if let Some(d) = cur_dep.as_mut() {
                                d.container = value.clone();
                            }
                        }
                        "target" if cur_dep.is_some() => {
                            if let Some(d) = cur_dep.as_mut() {
                                d.target = Some(value.clone());
                            }
                        }
                        "dependency" => {
                            if let (Some(s), Some(d)) = (cur_service.as_mut(), cur_dep.take()) {
                                if path.iter().any(|p| p == "connectsTo") {
                                    s.connects_on.push(d);
                                } else {
                                    s.depends_on.push(d);
                                }
                            }
                        }
                        "service" if cur_service.is_some() && cur_dep.is_none() => {
                            if let Some(s) = cur_service.take() {
                                let service = s.build();
                                manifest.services.insert(service.name.clone(), service);
                            }
                        }
                        "numOfCores" => {
                            if let Some(t) = cur_target.as_mut() {
                                t.num_of_cores = value.parse().unwrap_or(1);
                            }
                        }
                        "clientInterface" => {
                            if let Some(t) = cur_target.as_mut() {
                                t.client_interface = value.clone();
                            }
                        }
                        "targetProperty" => {
                            if let Some(t) = cur_target.as_mut() {
                                t.target_property = value.clone();
                            }
                        }
                        "property" => {
                            if let Some(t) = cur_target.as_mut() {
                                if let Some(pname) = t.pending_property.take() {
                                    if let Some(container) = cur_container_name.clone() {
                                        t.containers.entry(container).or_default().insert(pname, value.clone());
                                    } else {
                                        t.properties.insert(pname, value.clone());
                                    }
                                }
                            }
                        }
                        "service" if cur_mapping.is_some() => {
                            if let Some(m) = cur_mapping.as_mut() {
                                m.service = value.clone();
                            }
                        }
                        "service" if cur_snapshot.is_some() => {
                            if let Some(s) = cur_snapshot.as_mut() {
                                s.service = value.clone();
                            }
                        }
                        "container" if cur_mapping.is_some() => {
                            if let Some(m) = cur_mapping.as_mut() {
                                m.container = value.clone();
                            }
                        }
                        "container" if cur_snapshot.is_some() => {
                            if let Some(s) = cur_snapshot.as_mut() {
                                s.container = value.clone();
                            }
                        }
                        "target" if cur_mapping.is_some() => {
                            if let Some(m) = cur_mapping.as_mut() {
                                m.target = value.clone();
                            }
                        }
                        "target" if cur_snapshot.is_some() => {
                            if let Some(s) = cur_snapshot.as_mut() {
                                s.target = value.clone();
                            }
                        }
                        "component" => {
                            if let Some(s) = cur_snapshot.as_mut() {
                                s.component = value.clone();
                            }
                        }
                        // bare fallbacks: only reached once the mapping/snapshot/dependency
                        // guarded arms above have all declined to match.
                        "container" => {
                            cur_container_name = None;
                        }
                        "target" => {
                            if let Some(t) = cur_target.take() {
                                let target = t.build();
                                manifest.targets.insert(target.name.clone(), target);
                            }
                        }
                        "mapping" if cur_mapping.is_some() => {
                            if let Some(m) = cur_mapping.take() {
                                let mapping = ServiceMapping::new(m.service, m.container, m.target);
                                let key = mapping.key();
                                if manifest.service_mappings.contains_key(&key) {
                                    return Err(ManifestError::DuplicateMapping {
                                        service: key.service,
                                        container: key.container,
                                        target: key.target,
                                    });
                                }
                                manifest.service_mappings.insert(key, mapping);
                            }
                        }
                        "mapping" if cur_snapshot.is_some() => {
                            if let Some(s) = cur_snapshot.take() {
                                manifest.snapshot_mappings.push(SnapshotMapping {
                                    service: s.service,
                                    container: s.container,
                                    target: s.target,
                                    component: s.component,
                                    transferred: false,
                                });
                            }
                        }
                        _ => {}
                    }
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        validate_references(&manifest)?;
        detect_cycles(&manifest)?;
        Ok(manifest)
    }
}

fn validate_references(manifest: &Manifest) -> Result<(), ManifestError> {
    for (key, mapping) in manifest.service_mappings.iter() {
        if !manifest.services.contains_key(&mapping.service) {
            return Err(ManifestError::MissingReference {
                service: key.service.clone(),
                container: key.container.clone(),
                target: key.target.clone(),
                what: "service",
                name: mapping.service.clone(),
            });
        }
        if !manifest.targets.contains_key(&mapping.target) {
            return Err(ManifestError::MissingReference {
                service: key.service.clone(),
                container: key.container.clone(),
                target: key.target.clone(),
                what: "target",
                name: mapping.target.clone(),
            });
        }
    }
    Ok(())
}

fn detect_cycles(manifest: &Manifest) -> Result<(), ManifestError> {
    use petgraph::algo::is_cyclic_directed;
    use petgraph::graphmap::DiGraphMap;

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in manifest.services.keys() {
        graph.add_node(name.as_str());
    }
    for service in manifest.services.values() {
        for dep in &service.depends_on {
            if manifest.services.contains_key(&dep.service) {
                graph.add_edge(service.name.as_str(), dep.service.as_str(), ());
            }
        }
    }
    if is_cyclic_directed(&graph) {
        let names = manifest.services.keys().cloned().collect();
        return Err(ManifestError::CyclicDependency(names));
    }
    Ok(())
}

#[derive(Default)]
struct ServiceBuilder {
    name: String,
    package: String,
    service_type: String,
    depends_on: Vec<DependencyRef>,
    connects_on: Vec<DependencyRef>,
}

impl ServiceBuilder {
    fn build(self) -> Service {
        Service {
            name: self.name,
            package: self.package,
            service_type: self.service_type,
            depends_on: self.depends_on,
            connects_on: self.connects_on,
        }
    }
}

struct TargetBuilder {
    name: String,
    properties: OrderedMap<String, String>,
    containers: std::collections::HashMap<String, OrderedMap<String, String>>,
    client_interface: String,
    target_property: String,
    num_of_cores: u32,
    pending_property: Option<String>,
}

impl TargetBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            properties: OrderedMap::new(),
            containers: std::collections::HashMap::new(),
            client_interface: String::new(),
            target_property: "hostname".to_string(),
            num_of_cores: 1,
            pending_property: None,
        }
    }

    fn build(self) -> Target {
        Target {
            name: self.name,
            properties: self.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            containers: self
                .containers
                .into_iter()
                .map(|(k, v)| (k, v.iter().map(|(pk, pv)| (pk.clone(), pv.clone())).collect()))
                .collect(),
            client_interface: self.client_interface,
            target_property: self.target_property,
            num_of_cores: self.num_of_cores,
        }
    }
}

#[derive(Default)]
struct MappingBuilder {
    service: String,
    container: String,
    target: String,
}

#[derive(Default)]
struct SnapshotBuilder {
    service: String,
    container: String,
    target: String,
    component: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_XML: &str = r#"
    <manifest>
      <services>
        <service>
          <name>webapp</name>
          <type>process</type>
          <pkg>/nix/store/abc-webapp</pkg>
          <dependsOn>
            <dependency>
              <service>database</service>
              <container>mysql-database</container>
            </dependency>
          </dependsOn>
        </service>
        <service>
          <name>database</name>
          <type>mysql-database</type>
          <pkg>/nix/store/def-database</pkg>
        </service>
      </services>
      <infrastructure>
        <target name="test1">
          <property name="hostname">test1</property>
          <numOfCores>2</numOfCores>
          <clientInterface>disnix-ssh-client</clientInterface>
          <container name="mysql-database">
            <property name="port">3306</property>
          </container>
          <container name="process">
          </container>
        </target>
      </infrastructure>
      <distribution>
        <mapping>
          <service>webapp</service>
          <container>process</container>
          <target>test1</target>
        </mapping>
        <mapping>
          <service>database</service>
          <container>mysql-database</container>
          <target>test1</target>
        </mapping>
      </distribution>
    </manifest>
    "#;

    #[test]
    fn parses_services_targets_and_mappings() {
        let manifest = Manifest::load_xml(MANIFEST_XML.as_bytes()).unwrap();
        assert_eq!(manifest.services.len(), 2);
        assert_eq!(manifest.targets.len(), 1);
        assert_eq!(manifest.service_mappings.len(), 2);

        let target = manifest.targets.get(&"test1".to_string()).unwrap();
        assert_eq!(target.num_of_cores, 2);
        assert_eq!(target.client_interface, "disnix-ssh-client");
        assert_eq!(target.properties.get("hostname").map(String::as_str), Some("test1"));
    }

    #[test]
    fn rejects_dangling_service_reference() {
        let xml = r#"
        <manifest>
          <services></services>
          <infrastructure>
            <target name="test1">
              <clientInterface>disnix-ssh-client</clientInterface>
              <numOfCores>1</numOfCores>
            </target>
          </infrastructure>
          <distribution>
            <mapping><service>ghost</service><container>c</container><target>test1</target></mapping>
          </distribution>
        </manifest>
        "#;
        let err = Manifest::load_xml(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::MissingReference { what: "service", .. }));
    }

    #[test]
    fn rejects_duplicate_mapping() {
        let xml = r#"
        <manifest>
          <services>
            <service><name>webapp</name><type>process</type><pkg>/x</pkg></service>
          </services>
          <infrastructure>
            <target name="test1">
              <clientInterface>disnix-ssh-client</clientInterface>
              <numOfCores>1</numOfCores>
            </target>
          </infrastructure>
          <distribution>
            <mapping><service>webapp</service><container>c</container><target>test1</target></mapping>
            <mapping><service>webapp</service><container>c</container><target>test1</target></mapping>
          </distribution>
        </manifest>
        "#;
        let err = Manifest::load_xml(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateMapping { .. }));
    }

    #[test]
    fn rejects_cyclic_dependency() {
        let xml = r#"
        <manifest>
          <services>
            <service>
              <name>a</name><type>process</type><pkg>/a</pkg>
              <dependsOn><dependency><service>b</service><container>c</container></dependency></dependsOn>
            </service>
            <service>
              <name>b</name><type>process</type><pkg>/b</pkg>
              <dependsOn><dependency><service>a</service><container>c</container></dependency></dependsOn>
            </service>
          </services>
          <infrastructure>
            <target name="test1"><clientInterface>x</clientInterface><numOfCores>1</numOfCores></target>
          </infrastructure>
          <distribution></distribution>
        </manifest>
        "#;
        let err = Manifest::load_xml(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::CyclicDependency(_)));
    }
}
