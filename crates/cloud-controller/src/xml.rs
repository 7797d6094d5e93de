//! EC2-schema XML response rendering. Every response wraps
//! its payload in `<Action>Response>` with a `requestId` element first,
//! matching what a real EC2-compatible client expects to parse.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use std::io::Cursor;

use cloud_core::error::CloudError;
use cloud_core::model::{FloatingIp, Instance, KeyPair, SecurityGroup, Snapshot, Volume};

use crate::image::ImageMetadata;

pub struct XmlResponse {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlResponse {
    /// Opens `<{action}Response xmlns="...">` and writes the
    /// `requestId` element every EC2 response leads with.
    pub fn start(action: &str, request_id: &str) -> Self {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let root_name = format!("{action}Response");
        let mut root = BytesStart::new(root_name);
        root.push_attribute(("xmlns", "http://ec2.amazonaws.com/doc/2016-11-15/"));
        writer.write_event(Event::Start(root)).unwrap();
        write_text_element(&mut writer, "requestId", request_id);
        XmlResponse { writer }
    }

    pub fn text_element(&mut self, name: &str, value: &str) -> &mut Self {
        write_text_element(&mut self.writer, name, value);
        self
    }

    pub fn open(&mut self, name: &str) -> &mut Self {
        self.writer.write_event(Event::Start(BytesStart::new(name))).unwrap();
        self
    }

    pub fn close(&mut self, name: &str) -> &mut Self {
        self.writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
        self
    }

    pub fn writer_mut(&mut self) -> &mut Writer<Cursor<Vec<u8>>> {
        &mut self.writer
    }

    /// Closes `</{action}Response>` and returns the rendered document.
    pub fn finish(mut self, action: &str) -> String {
        let root_name = format!("{action}Response");
        self.writer.write_event(Event::End(BytesEnd::new(root_name))).unwrap();
        String::from_utf8(self.writer.into_inner().into_inner()).expect("xml writer produces valid utf8")
    }
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, value: &str) {
    writer.write_event(Event::Start(BytesStart::new(name))).unwrap();
    writer.write_event(Event::Text(BytesText::new(value))).unwrap();
    writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
}

/// Renders a `CloudError` as an EC2-schema `<Response><Errors>` body,
/// paired with `error.http_status()` at the HTTP layer.
pub fn render_error(error: &CloudError, request_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Start(BytesStart::new("Response"))).unwrap();
    writer.write_event(Event::Start(BytesStart::new("Errors"))).unwrap();
    writer.write_event(Event::Start(BytesStart::new("Error"))).unwrap();
    write_text_element(&mut writer, "Code", error.ec2_code());
    write_text_element(&mut writer, "Message", &error.to_string());
    writer.write_event(Event::End(BytesEnd::new("Error"))).unwrap();
    writer.write_event(Event::End(BytesEnd::new("Errors"))).unwrap();
    write_text_element(&mut writer, "RequestID", request_id);
    writer.write_event(Event::End(BytesEnd::new("Response"))).unwrap();
    String::from_utf8(writer.into_inner().into_inner()).expect("xml writer produces valid utf8")
}

fn instance_item(writer: &mut Writer<Cursor<Vec<u8>>>, instance: &Instance) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "instanceId", &instance.ec2_id);
    write_text_element(writer, "imageId", &instance.image_ref);
    write_text_element(writer, "instanceState", &instance.state.to_string());
    write_text_element(writer, "instanceType", &instance.instance_type_id);
    write_text_element(writer, "reservationId", &instance.reservation_id);
    if let Some(ip) = &instance.private_ip {
        write_text_element(writer, "privateIpAddress", ip);
    }
    if let Some(ip) = &instance.public_ip {
        write_text_element(writer, "ipAddress", ip);
    }
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_instances(instances: &[Instance], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeInstances", request_id);
    response.open("reservationSet").open("item").open("instancesSet");
    for instance in instances {
        instance_item(response.writer_mut(), instance);
    }
    response.close("instancesSet").close("item").close("reservationSet");
    response.finish("DescribeInstances")
}

fn volume_item(writer: &mut Writer<Cursor<Vec<u8>>>, volume: &Volume) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "volumeId", &volume.ec2_id);
    write_text_element(writer, "size", &volume.size_gb.to_string());
    write_text_element(writer, "status", &format!("{:?}", volume.status));
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_volumes(volumes: &[Volume], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeVolumes", request_id);
    response.open("volumeSet");
    for volume in volumes {
        volume_item(response.writer_mut(), volume);
    }
    response.close("volumeSet");
    response.finish("DescribeVolumes")
}

fn snapshot_item(writer: &mut Writer<Cursor<Vec<u8>>>, snapshot: &Snapshot) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "snapshotId", &snapshot.ec2_id);
    write_text_element(writer, "volumeId", &snapshot.volume_id);
    write_text_element(writer, "status", &format!("{:?}", snapshot.status));
    write_text_element(writer, "progress", &format!("{}%", snapshot.progress));
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_snapshots(snapshots: &[Snapshot], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeSnapshots", request_id);
    response.open("snapshotSet");
    for snapshot in snapshots {
        snapshot_item(response.writer_mut(), snapshot);
    }
    response.close("snapshotSet");
    response.finish("DescribeSnapshots")
}

fn address_item(writer: &mut Writer<Cursor<Vec<u8>>>, address: &FloatingIp) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "publicIp", &address.address);
    if let Some(fixed_ip_id) = &address.fixed_ip_id {
        write_text_element(writer, "instanceId", fixed_ip_id);
    }
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_addresses(addresses: &[FloatingIp], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeAddresses", request_id);
    response.open("addressesSet");
    for address in addresses {
        address_item(response.writer_mut(), address);
    }
    response.close("addressesSet");
    response.finish("DescribeAddresses")
}

fn security_group_item(writer: &mut Writer<Cursor<Vec<u8>>>, group: &SecurityGroup) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "groupId", &group.id);
    write_text_element(writer, "groupName", &group.name);
    write_text_element(writer, "groupDescription", &group.description);
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_security_groups(groups: &[SecurityGroup], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeSecurityGroups", request_id);
    response.open("securityGroupInfo");
    for group in groups {
        security_group_item(response.writer_mut(), group);
    }
    response.close("securityGroupInfo");
    response.finish("DescribeSecurityGroups")
}

fn key_pair_item(writer: &mut Writer<Cursor<Vec<u8>>>, pair: &KeyPair) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "keyName", &pair.name);
    write_text_element(writer, "keyFingerprint", &pair.fingerprint);
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_key_pairs(pairs: &[KeyPair], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeKeyPairs", request_id);
    response.open("keySet");
    for pair in pairs {
        key_pair_item(response.writer_mut(), pair);
    }
    response.close("keySet");
    response.finish("DescribeKeyPairs")
}

/// `CreateKeyPair` returns the one pair's private material inline, unlike
/// `DescribeKeyPairs` which never exposes it again.
pub fn render_create_key_pair(pair: &KeyPair, request_id: &str) -> String {
    let mut response = XmlResponse::start("CreateKeyPair", request_id);
    response.text_element("keyName", &pair.name);
    response.text_element("keyFingerprint", &pair.fingerprint);
    response.finish("CreateKeyPair")
}

fn image_item(writer: &mut Writer<Cursor<Vec<u8>>>, image: &ImageMetadata) {
    writer.write_event(Event::Start(BytesStart::new("item"))).unwrap();
    write_text_element(writer, "imageId", &image.id);
    write_text_element(writer, "imageOwnerId", &image.owner_project_id);
    let state = match image.state {
        crate::image::ImageState::Available => "available",
        crate::image::ImageState::Pending => "pending",
        crate::image::ImageState::Failed => "failed",
    };
    write_text_element(writer, "imageState", state);
    write_text_element(writer, "isPublic", if image.is_public { "true" } else { "false" });
    writer.write_event(Event::End(BytesEnd::new("item"))).unwrap();
}

pub fn render_describe_images(images: &[ImageMetadata], request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeImages", request_id);
    response.open("imagesSet");
    for image in images {
        image_item(response.writer_mut(), image);
    }
    response.close("imagesSet");
    response.finish("DescribeImages")
}

pub fn render_describe_availability_zones(zone_name: &str, request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeAvailabilityZones", request_id);
    response.open("availabilityZoneInfo").open("item");
    response.text_element("zoneName", zone_name);
    response.text_element("zoneState", "available");
    response.close("item").close("availabilityZoneInfo");
    response.finish("DescribeAvailabilityZones")
}

pub fn render_describe_regions(region_name: &str, endpoint: &str, request_id: &str) -> String {
    let mut response = XmlResponse::start("DescribeRegions", request_id);
    response.open("regionInfo").open("item");
    response.text_element("regionName", region_name);
    response.text_element("regionEndpoint", endpoint);
    response.close("item").close("regionInfo");
    response.finish("DescribeRegions")
}

pub fn render_console_output(instance_ec2_id: &str, output: &str, request_id: &str) -> String {
    let mut response = XmlResponse::start("GetConsoleOutput", request_id);
    response.text_element("instanceId", instance_ec2_id);
    response.text_element("timestamp", &chrono::Utc::now().to_rfc3339());
    response.text_element("output", &base64::Engine::encode(&base64::engine::general_purpose::STANDARD, output));
    response.finish("GetConsoleOutput")
}

pub fn render_password_data(instance_ec2_id: &str, password_data: &str, request_id: &str) -> String {
    let mut response = XmlResponse::start("GetPasswordData", request_id);
    response.text_element("instanceId", instance_ec2_id);
    response.text_element("timestamp", &chrono::Utc::now().to_rfc3339());
    response.text_element("passwordData", password_data);
    response.finish("GetPasswordData")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cloud_core::model::InstanceStatus;

    fn sample_instance() -> Instance {
        Instance {
            id: "i-1".into(),
            uuid: "i-1".into(),
            ec2_id: "i-00000001".into(),
            project_id: "acme".into(),
            user_id: "bob".into(),
            image_ref: "ami-00000001".into(),
            kernel_ref: None,
            ramdisk_ref: None,
            instance_type_id: "m1.small".into(),
            reservation_id: "r-1".into(),
            launch_time: Utc::now(),
            state: InstanceStatus::Running,
            state_description: "running".into(),
            host: Some("host1".into()),
            mac: "06:00:00:00:00:01".into(),
            private_ip: Some("10.0.0.5".into()),
            public_ip: None,
            key_name: None,
            key_data: None,
            root_device_name: "/dev/sda1".into(),
            block_device_mapping: Vec::new(),
            security_group_ids: Vec::new(),
            display_name: "i-1".into(),
        }
    }

    #[test]
    fn describe_instances_embeds_request_id_and_instance_id() {
        let xml = render_describe_instances(&[sample_instance()], "req-1");
        assert!(xml.contains("<requestId>req-1</requestId>"));
        assert!(xml.contains("i-00000001"));
        assert!(xml.starts_with("<DescribeInstancesResponse"));
        assert!(xml.ends_with("</DescribeInstancesResponse>"));
    }

    #[test]
    fn render_error_includes_ec2_code() {
        let xml = render_error(&CloudError::NotFound("i-deadbeef".into()), "req-2");
        assert!(xml.contains("InvalidResource.NotFound"));
        assert!(xml.contains("req-2"));
    }

    #[test]
    fn describe_volumes_renders_every_volume() {
        let vol = Volume {
            id: "vol-1".into(),
            ec2_id: "vol-00000001".into(),
            project_id: "acme".into(),
            user_id: "bob".into(),
            size_gb: 10,
            status: cloud_core::model::VolumeStatus::Available,
            attach_status: cloud_core::model::AttachStatus::Detached,
            host: None,
            instance_uuid: None,
            mountpoint: None,
            snapshot_id: None,
            iscsi_target_num: None,
        };
        let xml = render_describe_volumes(&[vol], "req-3");
        assert!(xml.contains("vol-00000001"));
    }

    #[test]
    fn describe_key_pairs_renders_fingerprint() {
        let pair = KeyPair {
            owner_user_id: "bob".into(),
            name: "laptop".into(),
            public_key: "ssh-rsa AAAA...laptop".into(),
            fingerprint: "aa:bb".into(),
        };
        let xml = render_describe_key_pairs(&[pair], "req-4");
        assert!(xml.contains("<keyName>laptop</keyName>"));
        assert!(xml.contains("aa:bb"));
    }

    #[test]
    fn describe_images_renders_state_and_owner() {
        let image = ImageMetadata {
            id: "ami-00000001".into(),
            owner_project_id: "acme".into(),
            container_type: crate::image::ContainerType::Ami,
            state: crate::image::ImageState::Available,
            is_public: false,
            shared_with: Vec::new(),
        };
        let xml = render_describe_images(&[image], "req-5");
        assert!(xml.contains("ami-00000001"));
        assert!(xml.contains("<imageState>available</imageState>"));
        assert!(xml.contains("<imageOwnerId>acme</imageOwnerId>"));
    }

    #[test]
    fn console_output_base64_encodes_the_payload() {
        let xml = render_console_output("i-00000001", "boot ok", "req-6");
        assert!(xml.contains(&base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "boot ok")));
    }
}
