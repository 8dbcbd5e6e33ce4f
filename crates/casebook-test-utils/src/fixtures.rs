use chrono::{DateTime, Utc};

use casebook_core::types::{Automation, AutomationType, Playbook, Task, TaskType};

use crate::FixedClock;
use mockable::Clock;

pub const PYTHON_IMAGE: &str = "docker.io/python:3";

pub const MALWARE_YAML: &str = r#"name: Malware
tasks:
  file-or-hash:
    name: Do you have the file or the hash?
    type: input
    schema:
      title: Malware
      type: object
      properties:
        file:
          type: string
          title: "I have the"
          enum: [ "File", "Hash" ]
    next:
      enter-hash: "file == 'Hash'"
      upload: "file == 'File'"

  enter-hash:
    name: Please enter the hash
    type: input
    schema:
      title: Malware
      type: object
      properties:
        hash:
          type: string
          title: Please enter the hash value
          minlength: 32
    next:
      virustotal: "hash != ''"

  upload:
    name: Upload the malware
    type: input
    schema:
      title: Malware
      type: object
      properties:
        malware:
          type: object
          x-display: file
          title: Please upload the malware
    next:
      hash: "malware"

  hash:
    name: Hash the malware
    type: automation
    automation: hash.sha1
    payload:
      default: "playbook.tasks['upload'].data['malware']"
    next:
      virustotal:

  virustotal:
    name: Send hash to VirusTotal
    type: automation
    automation: vt.hash
    payload:
      default: "playbook.tasks['enter-hash'].data['hash'] || playbook.tasks['hash'].data['hash']"
"#;

/// Input, then two chained automations, then a human task.
pub const SIMPLE_YAML: &str = r#"name: Simple
tasks:
  input:
    name: Enter something to hash
    type: input
    schema:
      title: Something
      type: object
      properties:
        something:
          type: string
          title: Something
          default: ""
    next:
      hash: "something != ''"

  hash:
    name: Hash the something
    type: automation
    automation: hash.sha1
    payload:
      default: "playbook.tasks['input'].data['something']"
    next:
      comment: "hash != ''"

  comment:
    name: Comment the hash
    type: automation
    automation: comment
    payload:
      default: "playbook.tasks['hash'].data['hash']"
    next:
      done: "done"

  done:
    name: You can close this case now
    type: task
"#;

/// Starts with an automation task.
pub const ENRICH_FIRST_YAML: &str = r#"name: Enrich First
tasks:
  hash:
    name: Hash the ticket name
    type: automation
    automation: hash.sha1
    payload:
      default: "ticket.name"
    next:
      review:

  review:
    name: Review the hash
    type: task
"#;

fn created() -> DateTime<Utc> {
    FixedClock::default().utc()
}

fn task(name: &str, kind: TaskType) -> Task {
    Task::new(name, kind, created())
}

/// Board involvement decides between escalation and mail handling.
pub fn phishing_playbook() -> Playbook {
    let tasks = [
        (
            "board",
            task("Board Involvement?", TaskType::Input)
                .with_next("escalate", "boardInvolved == true")
                .with_next("aquire-mail", "boardInvolved == false"),
        ),
        ("escalate", task("Escalate to CISO", TaskType::Task)),
        (
            "aquire-mail",
            task("Acquire mail", TaskType::Input)
                .with_next("extract-iocs", "schemaKey == 'yes'")
                .with_next("block-sender", "schemaKey == 'yes'")
                .with_next("search-email-gateway", "schemaKey == 'no'"),
        ),
        (
            "extract-iocs",
            task("Extract IOCs", TaskType::Input).with_next("fetch-iocs", ""),
        ),
        (
            "fetch-iocs",
            task("Fetch IOCs", TaskType::Task).with_next("block-iocs", ""),
        ),
        (
            "search-email-gateway",
            task("Search email gateway", TaskType::Task).with_next("block-iocs", ""),
        ),
        (
            "block-sender",
            task("Block sender", TaskType::Task).with_next("block-iocs", ""),
        ),
        (
            "block-iocs",
            task("Block IOCs", TaskType::Task).with_next("block-ioc", ""),
        ),
        ("block-ioc", task("Block IOC", TaskType::Task)),
    ];

    Playbook {
        name: "Phishing".into(),
        tasks: tasks
            .into_iter()
            .map(|(id, task)| (id.to_string(), task))
            .collect(),
    }
}

/// File or hash, then hashing, then a VirusTotal lookup.
pub fn malware_playbook() -> Playbook {
    let tasks = [
        (
            "file-or-hash",
            task("Do you have the file or the hash?", TaskType::Input)
                .with_next("enter-hash", "file == 'Hash'")
                .with_next("upload", "file == 'File'"),
        ),
        (
            "enter-hash",
            task("Please enter the hash", TaskType::Input).with_next("virustotal", "hash != ''"),
        ),
        (
            "upload",
            task("Upload the malware", TaskType::Input).with_next("hash", "malware"),
        ),
        (
            "hash",
            task("Hash the malware", TaskType::Automation)
                .with_automation("hash.sha1")
                .with_payload("default", "playbook.tasks['upload'].data['malware']")
                .with_next("virustotal", ""),
        ),
        (
            "virustotal",
            task("Send hash to VirusTotal", TaskType::Automation)
                .with_automation("vt.hash")
                .with_payload(
                    "default",
                    "playbook.tasks['enter-hash'].data['hash'] || playbook.tasks['hash'].data['hash']",
                ),
        ),
    ];

    Playbook {
        name: "Malware".into(),
        tasks: tasks
            .into_iter()
            .map(|(id, task)| (id.to_string(), task))
            .collect(),
    }
}

pub fn automation(id: &str, script: &str) -> Automation {
    Automation {
        id: id.to_string(),
        image: PYTHON_IMAGE.to_string(),
        script: script.to_string(),
        schema: None,
        kinds: vec![
            AutomationType::Global,
            AutomationType::Artifact,
            AutomationType::Playbook,
        ],
    }
}

pub fn hash_automation() -> Automation {
    automation(
        "hash.sha1",
        "#!/usr/bin/env python\nimport hashlib, json, sys\nmsg = json.loads(sys.argv[1])\nprint(json.dumps({'hash': hashlib.sha1(msg['payload']['default'].encode()).hexdigest()}))\n",
    )
}

pub fn comment_automation() -> Automation {
    automation(
        "comment",
        "#!/usr/bin/env python\nimport json, sys\nprint(json.dumps({'done': True}))\n",
    )
}
