//! Loading and validating XML manifests end to end.

use coordination::manifest::{Manifest, ManifestError};

const TWO_TARGET_MANIFEST: &str = r#"
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
    </target>
    <target name="test2">
      <property name="hostname">test2</property>
      <numOfCores>1</numOfCores>
      <clientInterface>disnix-ssh-client</clientInterface>
    </target>
  </infrastructure>
  <distribution>
    <mapping>
      <service>database</service>
      <container>mysql-database</container>
      <target>test1</target>
    </mapping>
    <mapping>
      <service>webapp</service>
      <container>process</container>
      <target>test2</target>
    </mapping>
  </distribution>
  <snapshots>
    <mapping>
      <service>database</service>
      <container>mysql-database</container>
      <target>test1</target>
      <component>mysql-state</component>
    </mapping>
  </snapshots>
</manifest>
"#;

#[test]
fn loads_services_targets_mappings_and_snapshots() {
    let manifest = Manifest::load_xml(TWO_TARGET_MANIFEST.as_bytes()).unwrap();
    assert_eq!(manifest.services.len(), 2);
    assert_eq!(manifest.targets.len(), 2);
    assert_eq!(manifest.service_mappings.len(), 2);
    assert_eq!(manifest.snapshot_mappings.len(), 1);
    assert_eq!(manifest.snapshot_mappings[0].component, "mysql-state");
}

#[test]
fn cross_target_dependency_resolves_via_implicit_target_rule() {
    let manifest = Manifest::load_xml(TWO_TARGET_MANIFEST.as_bytes()).unwrap();
    let webapp = manifest.services.get(&"webapp".to_string()).unwrap();
    let dep = &webapp.depends_on[0];
    assert_eq!(dep.target, None);
    assert_eq!(dep.resolved_target("test2"), "test2");
}

#[test]
fn missing_target_reference_is_rejected() {
    let xml = r#"
    <manifest>
      <services>
        <service><name>webapp</name><type>process</type><pkg>/x</pkg></service>
      </services>
      <infrastructure></infrastructure>
      <distribution>
        <mapping><service>webapp</service><container>process</container><target>ghost</target></mapping>
      </distribution>
    </manifest>
    "#;
    let err = Manifest::load_xml(xml.as_bytes()).unwrap_err();
    assert!(matches!(err, ManifestError::MissingReference { what: "target", .. }));
}
